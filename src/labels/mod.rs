//! Per-workload webhook configuration read from metadata labels.
//!
//! Every recognized key lives under [`LABEL_PREFIX`] and is described once in
//! [`SCHEMA`] with its default and, where it has one, the closed set of legal
//! values. Resolution turns the flat label map into a typed [`WebhookConfig`].

use reqwest::Url;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Namespace all crosswind labels live under
pub const LABEL_PREFIX: &str = "crosswind.sh/";

/// Label keys, relative to [`LABEL_PREFIX`]
pub mod keys {
    pub const HTTP_URL: &str = "webhook.http.url";
    pub const HTTP_METHOD: &str = "webhook.http.method";
    pub const HTTP_TIMEOUT: &str = "webhook.http.timeout";
    pub const BASIC_USERNAME: &str = "webhook.auth.basic.username";
    pub const BASIC_PASSWORD: &str = "webhook.auth.basic.password";
    pub const TOKEN_HEADER: &str = "webhook.auth.token.header";
    pub const TOKEN_TYPE: &str = "webhook.auth.token.type";
    pub const TOKEN_TOKEN: &str = "webhook.auth.token.token";
}

pub const DEFAULT_TIMEOUT_SECS: u64 = 2;
pub const DEFAULT_TOKEN_HEADER: &str = "Authorization";
pub const DEFAULT_TOKEN_TYPE: &str = "token";

/// One recognized label.
#[derive(Debug)]
pub struct LabelSpec {
    pub key: &'static str,
    pub default: Option<&'static str>,
    /// Legal values; empty means any value is accepted
    pub values: &'static [&'static str],
    /// Never log the value
    pub secret: bool,
}

pub const SCHEMA: &[LabelSpec] = &[
    LabelSpec {
        key: keys::HTTP_URL,
        default: None,
        values: &[],
        secret: false,
    },
    LabelSpec {
        key: keys::HTTP_METHOD,
        default: Some("post"),
        values: &["get", "post"],
        secret: false,
    },
    LabelSpec {
        key: keys::HTTP_TIMEOUT,
        default: Some("2"),
        values: &[],
        secret: false,
    },
    LabelSpec {
        key: keys::BASIC_USERNAME,
        default: None,
        values: &[],
        secret: false,
    },
    LabelSpec {
        key: keys::BASIC_PASSWORD,
        default: None,
        values: &[],
        secret: true,
    },
    LabelSpec {
        key: keys::TOKEN_HEADER,
        default: Some(DEFAULT_TOKEN_HEADER),
        values: &[],
        secret: false,
    },
    LabelSpec {
        key: keys::TOKEN_TYPE,
        default: Some(DEFAULT_TOKEN_TYPE),
        values: &[],
        secret: false,
    },
    LabelSpec {
        key: keys::TOKEN_TOKEN,
        default: None,
        values: &[],
        secret: true,
    },
];

/// Full label name for a schema key.
pub fn label(key: &str) -> String {
    format!("{}{}", LABEL_PREFIX, key)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenAuth {
    pub header: String,
    pub kind: String,
    pub token: String,
}

impl TokenAuth {
    /// Header value, e.g. `token abc123` or `Bearer abc123`.
    pub fn header_value(&self) -> String {
        if self.kind.is_empty() {
            self.token.clone()
        } else {
            format!("{} {}", self.kind, self.token)
        }
    }
}

/// Resolved webhook settings for one workload. Active iff `url` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub url: Option<Url>,
    pub method: HttpMethod,
    pub timeout: Duration,
    pub basic_auth: Option<BasicAuth>,
    pub token_auth: Option<TokenAuth>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            method: HttpMethod::Post,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            basic_auth: None,
            token_auth: None,
        }
    }
}

impl WebhookConfig {
    pub fn is_active(&self) -> bool {
        self.url.is_some()
    }

    /// Basic auth and the token would both write the `Authorization` header.
    pub fn token_conflicts_with_basic(&self) -> bool {
        match (&self.basic_auth, &self.token_auth) {
            (Some(_), Some(token)) => token.header.eq_ignore_ascii_case(DEFAULT_TOKEN_HEADER),
            _ => false,
        }
    }

    /// Resolve the webhook configuration of `workload` from its labels.
    pub fn from_labels(workload: &str, labels: &BTreeMap<String, String>) -> Self {
        let values = collect_values(workload, labels);
        let get = |key: &str| values.get(key).map(String::as_str);

        let url = get(keys::HTTP_URL).and_then(|raw| match validate_url(raw) {
            Some(url) => Some(url),
            None => {
                warn!(
                    "{}: Value '{}' for label {} is not a valid http(s) URL. Webhook disabled.",
                    workload,
                    raw,
                    label(keys::HTTP_URL)
                );
                None
            },
        });

        let method = match get(keys::HTTP_METHOD) {
            Some("get") => HttpMethod::Get,
            _ => HttpMethod::Post,
        };

        let timeout = match get(keys::HTTP_TIMEOUT).map(|raw| (raw, raw.trim().parse::<u64>())) {
            Some((_, Ok(secs))) if secs > 0 => Duration::from_secs(secs),
            Some((raw, _)) => {
                warn!(
                    "{}: Value '{}' for label {} is invalid. Using '{}'.",
                    workload,
                    raw,
                    label(keys::HTTP_TIMEOUT),
                    DEFAULT_TIMEOUT_SECS
                );
                Duration::from_secs(DEFAULT_TIMEOUT_SECS)
            },
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        let basic_auth = get(keys::BASIC_USERNAME).map(|username| BasicAuth {
            username: username.to_string(),
            password: get(keys::BASIC_PASSWORD).map(String::from),
        });

        let token_auth = get(keys::TOKEN_TOKEN).map(|token| TokenAuth {
            header: get(keys::TOKEN_HEADER)
                .unwrap_or(DEFAULT_TOKEN_HEADER)
                .to_string(),
            kind: get(keys::TOKEN_TYPE)
                .unwrap_or(DEFAULT_TOKEN_TYPE)
                .to_string(),
            token: token.to_string(),
        });

        let config = Self {
            url,
            method,
            timeout,
            basic_auth,
            token_auth,
        };

        if config.is_active() {
            debug!("{}: Webhook registered", workload);
        }

        config
    }
}

/// Apply the schema: enumerated values are checked, absent keys take their default.
fn collect_values(workload: &str, labels: &BTreeMap<String, String>) -> BTreeMap<&'static str, String> {
    let mut values = BTreeMap::new();

    for spec in SCHEMA {
        let present = labels
            .get(&label(spec.key))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty());

        let value = match present {
            Some(value) if !spec.values.is_empty() && !spec.values.contains(&value) => {
                warn!(
                    "{}: Value '{}' for label {} is invalid. Using '{}'.",
                    workload,
                    value,
                    label(spec.key),
                    spec.default.unwrap_or_default()
                );
                spec.default.map(String::from)
            },
            Some(value) => {
                if spec.secret {
                    debug!("{}: Registering {}: ********", workload, spec.key);
                } else {
                    debug!("{}: Registering {}: {}", workload, spec.key, value);
                }
                Some(value.to_string())
            },
            None => spec.default.map(String::from),
        };

        if let Some(value) = value {
            values.insert(spec.key, value);
        }
    }

    values
}

/// Accept only absolute http and https URLs.
pub fn validate_url(raw: &str) -> Option<Url> {
    Url::parse(raw)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
}
