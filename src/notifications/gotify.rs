use super::{GotifyConfig, NotificationPayload, Notifier, key_to_title};
use anyhow::{Context, Result, anyhow};
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info};

pub struct GotifyNotifier {
    endpoint: String,
    token: String,
    default_priority: Option<i64>,
    client: Client,
}

impl GotifyNotifier {
    pub fn new(config: GotifyConfig) -> Result<Self> {
        let url = config
            .url
            .ok_or_else(|| anyhow!("Gotify URL is required"))?;
        let token = config
            .token
            .ok_or_else(|| anyhow!("Gotify token is required"))?;

        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            endpoint: format!("{}/message", url.trim_end_matches('/')),
            token,
            default_priority: config.default_priority,
            client,
        })
    }

    /// Markdown body: the free-text message, or one bold key per field.
    fn build_message(&self, payload: &NotificationPayload) -> String {
        match &payload.message {
            Some(message) => message.clone(),
            None => payload
                .fields
                .iter()
                .map(|(key, value)| format!("**{}**: `{}`", key_to_title(key), value))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    fn build_body(&self, payload: &NotificationPayload) -> Value {
        let mut body = json!({
            "title": payload.title,
            "message": self.build_message(payload),
            "extras": {
                "client::display": { "contentType": "text/markdown" }
            },
        });

        if let Some(priority) = self.default_priority {
            body["priority"] = json!(priority);
        }

        body
    }
}

#[async_trait::async_trait]
impl Notifier for GotifyNotifier {
    async fn send(&self, payload: &NotificationPayload) -> Result<()> {
        let body = self.build_body(payload);

        let response = self
            .client
            .post(&self.endpoint)
            .header("X-Gotify-Key", &self.token)
            .json(&body)
            .send()
            .await
            .context("Failed to send Gotify notification")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response".to_string());
            return Err(anyhow!(
                "Gotify returned status {}: {}",
                status,
                error_text
            ));
        }

        info!("Sent message to gotify.");
        debug!("Message: {}", body);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Gotify"
    }

    fn is_enabled(&self) -> bool {
        !self.token.is_empty()
    }
}
