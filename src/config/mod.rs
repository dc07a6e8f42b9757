use crate::notifications::NotificationConfig;
use crate::scheduler::{Schedule, parse_interval};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_SLEEP_TIME: &str = "6h";
pub const DEFAULT_PROMETHEUS_PORT: u16 = 9308;

/// Startup configuration errors. Any of these stops the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{value} not understood: {reason}")]
    InvalidInterval { value: String, reason: String },
    #[error("{value} not understood. The error: {reason}")]
    InvalidCron { value: String, reason: String },
    #[error("FILTER_SERVICES must be in the form key=value, got '{0}'")]
    InvalidFilter(String),
}

/// Which optional fields go into an update notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyInclude {
    pub image: bool,
    pub old_image: bool,
    pub new_image: bool,
}

/// Settings for the reconciler itself.
#[derive(Debug, Clone, Default)]
pub struct ReconcilerConfig {
    /// Label selector passed to the orchestrator when listing workloads
    pub filter: Option<String>,
    /// Workload names that are never touched (exact match)
    pub blacklist: Vec<String>,
    /// Upper bound on convergence polling, unbounded when unset
    pub convergence_timeout: Option<Duration>,
    pub notify_include: NotifyInclude,
}

/// The whole process configuration, built once at startup.
#[derive(Debug)]
pub struct Config {
    pub schedule: Schedule,
    pub prometheus_port: u16,
    /// Restrict discovery to one namespace, all namespaces when unset
    pub namespace: Option<String>,
    pub reconciler: ReconcilerConfig,
    pub notifications: NotificationConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let filter = match get("FILTER_SERVICES") {
            Some(raw) => {
                info!("FILTER_SERVICES=\"{}\"", raw);
                Some(parse_filter(&raw)?)
            },
            None => {
                info!("FILTER_SERVICES is not set");
                None
            },
        };

        let blacklist: Vec<String> = match get("BLACKLIST_SERVICES") {
            Some(raw) => {
                info!("BLACKLIST_SERVICES=\"{}\"", raw);
                raw.split_whitespace().map(String::from).collect()
            },
            None => {
                info!("BLACKLIST_SERVICES is not set");
                Vec::new()
            },
        };

        let schedule = match get("SCHEDULE_TIME") {
            Some(expr) => {
                info!("SCHEDULE_TIME=\"{}\", ignoring SLEEP_TIME", expr);
                Schedule::cron(&expr)?
            },
            None => {
                let sleep_time = get("SLEEP_TIME").unwrap_or_else(|| DEFAULT_SLEEP_TIME.to_string());
                info!("SLEEP_TIME=\"{}\"", sleep_time);
                Schedule::interval(&sleep_time)?
            },
        };

        let prometheus_port = get("PROMETHEUS_PORT")
            .and_then(|v| parse_int::<u16>("PROMETHEUS_PORT", &v))
            .unwrap_or(DEFAULT_PROMETHEUS_PORT);

        let convergence_timeout = match get("CONVERGENCE_TIMEOUT") {
            Some(raw) => Some(parse_interval(&raw)?),
            None => None,
        };

        let notify_include = NotifyInclude {
            image: get_bool(&get, "NOTIFY_INCLUDE_IMAGE"),
            old_image: get_bool(&get, "NOTIFY_INCLUDE_OLD_IMAGE"),
            new_image: get_bool(&get, "NOTIFY_INCLUDE_NEW_IMAGE"),
        };

        Ok(Self {
            schedule,
            prometheus_port,
            namespace: get("NAMESPACE"),
            reconciler: ReconcilerConfig {
                filter,
                blacklist,
                convergence_timeout,
                notify_include,
            },
            notifications: NotificationConfig::from_lookup(&get),
        })
    }
}

/// Turn `key=value` into a label selector. The value may itself contain `=`.
fn parse_filter(raw: &str) -> Result<String, ConfigError> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok(format!("{}={}", key.trim(), value.trim()))
        },
        _ => Err(ConfigError::InvalidFilter(raw.to_string())),
    }
}

/// Parse an integer setting, warning and ignoring it when malformed.
pub(crate) fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("`{}` not understood for {}. Ignoring.", value, key);
            None
        },
    }
}

fn get_bool<G>(get: &G, key: &str) -> bool
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => match strtobool(&value) {
            Some(b) => b,
            None => {
                warn!("`{}` not understood for {}. Setting to false.", value, key);
                false
            },
        },
        None => false,
    }
}

/// Accepts y/yes/t/true/on/1 and n/no/f/false/off/0, case-insensitively.
pub fn strtobool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "y" | "yes" | "t" | "true" | "on" | "1" => Some(true),
        "n" | "no" | "f" | "false" | "off" | "0" => Some(false),
        _ => None,
    }
}
