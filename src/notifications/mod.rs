use crate::metrics;
use anyhow::Result;
use tracing::{debug, error, info};

mod gotify;
mod telegram;

pub use gotify::GotifyNotifier;
pub use telegram::{BotApi, HttpBotApi, TelegramError, TelegramNotifier};

/// Prefix added to every notification title
pub const TITLE_PREFIX: &str = "Crosswind";
pub const DEFAULT_TITLE: &str = "Service Updated";

/// Notification payload: a title plus either a free-text message or a list of fields.
///
/// Fields keep their insertion order and are rendered by each channel in its own
/// markup. When `message` is set the fields are not rendered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationPayload {
    pub title: String,
    pub message: Option<String>,
    pub fields: Vec<(String, String)>,
}

impl NotificationPayload {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: None,
            fields: Vec::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Convert a key in the form `a_is_b` to a title in the form `A Is B`.
pub fn key_to_title(key: &str) -> String {
    key.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Notification channels configured at startup
#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    pub telegram: TelegramConfig,
    pub gotify: GotifyConfig,
}

#[derive(Debug, Clone, Default)]
pub struct TelegramConfig {
    pub token: Option<String>,
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GotifyConfig {
    pub url: Option<String>,
    pub token: Option<String>,
    pub default_priority: Option<i64>,
}

impl NotificationConfig {
    /// Load channel settings through a key lookup (normally the environment)
    pub fn from_lookup<G>(get: &G) -> Self
    where
        G: Fn(&str) -> Option<String>,
    {
        Self {
            telegram: TelegramConfig {
                token: get("TELEGRAM_TOKEN"),
                chat_id: get("TELEGRAM_CHAT_ID"),
            },
            gotify: GotifyConfig {
                url: get("GOTIFY_URL"),
                token: get("GOTIFY_TOKEN"),
                default_priority: get("GOTIFY_DEFAULT_PRIORITY")
                    .and_then(|v| crate::config::parse_int("GOTIFY_DEFAULT_PRIORITY", &v)),
            },
        }
    }

    /// Check if any notification channels are configured
    pub fn has_enabled_channels(&self) -> bool {
        self.telegram.is_configured() || self.gotify.is_configured()
    }
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        self.token.is_some() && self.chat_id.is_some()
    }
}

impl GotifyConfig {
    pub fn is_configured(&self) -> bool {
        self.url.is_some() && self.token.is_some()
    }
}

/// A notification channel
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, payload: &NotificationPayload) -> Result<()>;
    fn name(&self) -> &'static str;
    fn is_enabled(&self) -> bool;
}

/// Fans a payload out to every registered channel
pub struct NotificationManager {
    notifiers: Vec<Box<dyn Notifier>>,
}

impl NotificationManager {
    pub fn new(config: &NotificationConfig) -> Self {
        let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();

        if config.telegram.is_configured() {
            match TelegramNotifier::new(config.telegram.clone()) {
                Ok(notifier) => notifiers.push(Box::new(notifier)),
                Err(e) => error!("Failed to create Telegram notifier: {}", e),
            }
        }

        if config.gotify.is_configured() {
            match GotifyNotifier::new(config.gotify.clone()) {
                Ok(notifier) => notifiers.push(Box::new(notifier)),
                Err(e) => error!("Failed to create Gotify notifier: {}", e),
            }
        }

        Self::with_notifiers(notifiers)
    }

    pub fn with_notifiers(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        info!(
            "Notification manager initialized with {} notifiers",
            notifiers.len()
        );
        Self { notifiers }
    }

    /// Send a notification to every enabled channel. Failures are logged, never returned.
    pub async fn notify(&self, payload: NotificationPayload) {
        if self.notifiers.is_empty() {
            return;
        }

        let title = format!(
            "{}: {}",
            TITLE_PREFIX,
            if payload.title.is_empty() {
                DEFAULT_TITLE
            } else {
                payload.title.as_str()
            }
        );
        let payload = NotificationPayload { title, ..payload };

        for notifier in &self.notifiers {
            if !notifier.is_enabled() {
                continue;
            }

            debug!("Sending notification to {}", notifier.name());
            match notifier.send(&payload).await {
                Ok(()) => {
                    info!("Notification sent successfully via {}", notifier.name());
                    metrics::NOTIFICATIONS_SENT_TOTAL.inc();
                },
                Err(e) => {
                    error!("Failed to send notification via {}: {}", notifier.name(), e);
                    metrics::NOTIFICATIONS_FAILED_TOTAL.inc();
                },
            }
        }
    }

    /// Get count of enabled notifiers
    pub fn enabled_count(&self) -> usize {
        self.notifiers.iter().filter(|n| n.is_enabled()).count()
    }
}
