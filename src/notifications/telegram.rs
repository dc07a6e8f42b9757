use super::{NotificationPayload, Notifier, TelegramConfig, key_to_title};
use anyhow::{Context, Result, anyhow};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Delay used when Telegram asks us to slow down without saying for how long
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(2);

/// Failures reported by the Bot API, split into transient and terminal classes.
#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Too many requests")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Timed out")]
    TimedOut,
    #[error("{0} - check TELEGRAM_TOKEN - skipping retries.")]
    Unauthorized(String),
    #[error("{0} - check TELEGRAM_CHAT_ID - skipping retries.")]
    ChatNotFound(String),
    #[error("{0} - skipping retries.")]
    BadRequest(String),
    #[error("Failed to send message! {0}")]
    Other(String),
}

impl TelegramError {
    /// How long to wait before retrying, or `None` if the failure is terminal.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(retry_after.unwrap_or(DEFAULT_RETRY_AFTER)),
            Self::TimedOut => Some(DEFAULT_RETRY_AFTER),
            _ => None,
        }
    }
}

/// The one Bot API call the notifier needs
#[async_trait::async_trait]
pub trait BotApi: Send + Sync {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), TelegramError>;
}

/// Bot API over HTTPS
pub struct HttpBotApi {
    client: Client,
    endpoint: String,
}

impl HttpBotApi {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_base_url(TELEGRAM_API_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/bot{}/sendMessage", base_url.trim_end_matches('/'), token),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    ok: bool,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

/// Map a Bot API response to success or a classified error.
fn classify_response(status: StatusCode, body: &str) -> Result<(), TelegramError> {
    let response: ApiResponse = serde_json::from_str(body).unwrap_or_default();

    if status.is_success() && response.ok {
        return Ok(());
    }

    let description = response
        .description
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(TelegramError::RateLimited {
            retry_after: response
                .parameters
                .and_then(|p| p.retry_after)
                .map(Duration::from_secs),
        }),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(TelegramError::Unauthorized(description))
        },
        StatusCode::BAD_REQUEST if description.to_lowercase().contains("chat not found") => {
            Err(TelegramError::ChatNotFound(description))
        },
        StatusCode::BAD_REQUEST => Err(TelegramError::BadRequest(description)),
        _ => Err(TelegramError::Other(description)),
    }
}

#[async_trait::async_trait]
impl BotApi for HttpBotApi {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), TelegramError> {
        let body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TelegramError::TimedOut
                } else {
                    TelegramError::Other(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response".to_string());

        classify_response(status, &text)
    }
}

pub struct TelegramNotifier {
    chat_id: String,
    api: Box<dyn BotApi>,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self> {
        let token = config
            .token
            .ok_or_else(|| anyhow!("Telegram token is required"))?;
        let chat_id = config
            .chat_id
            .ok_or_else(|| anyhow!("Telegram chat id is required"))?;

        debug!("Initialized Telegram notifier");
        Ok(Self::with_api(chat_id, Box::new(HttpBotApi::new(&token)?)))
    }

    pub fn with_api(chat_id: impl Into<String>, api: Box<dyn BotApi>) -> Self {
        Self {
            chat_id: chat_id.into(),
            api,
        }
    }

    /// Bold title, then the message or one bold key per field.
    fn build_message(&self, payload: &NotificationPayload) -> String {
        let mut text = format!("<b>{}</b>\n", escape_html(&payload.title));

        match &payload.message {
            Some(message) => text.push_str(&bold_to_html(&escape_html(message))),
            None => {
                for (key, value) in &payload.fields {
                    text.push_str(&format!(
                        "<b>{}</b>: <code>{}</code>\n",
                        key_to_title(key),
                        escape_html(value)
                    ));
                }
            },
        }

        text
    }

    /// Send, retrying for as long as Telegram reports a transient failure.
    async fn post_message(&self, text: &str) -> Result<()> {
        loop {
            match self.api.send_message(&self.chat_id, text).await {
                Ok(()) => {
                    info!("Sent message to telegram.");
                    debug!("Message: {}", text);
                    return Ok(());
                },
                Err(e) => match e.retry_delay() {
                    Some(delay) => {
                        warn!(
                            "Telegram request failed, retrying in {}s: {}",
                            delay.as_secs_f32(),
                            e
                        );
                        tokio::time::sleep(delay).await;
                    },
                    None => return Err(e.into()),
                },
            }
        }
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Turn balanced `**bold**` markdown into `<b>` tags; unbalanced text is left alone.
fn bold_to_html(text: &str) -> String {
    let parts: Vec<&str> = text.split("**").collect();
    if parts.len() % 2 == 0 {
        return text.to_string();
    }

    parts
        .iter()
        .enumerate()
        .map(|(i, part)| {
            if i % 2 == 1 {
                format!("<b>{}</b>", part)
            } else {
                part.to_string()
            }
        })
        .collect()
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, payload: &NotificationPayload) -> Result<()> {
        let text = self.build_message(payload);
        self.post_message(&text).await
    }

    fn name(&self) -> &'static str {
        "Telegram"
    }

    fn is_enabled(&self) -> bool {
        !self.chat_id.is_empty()
    }
}
