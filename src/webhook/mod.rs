//! Per-workload HTTP webhooks fired after a successful update.
//!
//! Each workload opts in through its own labels (see [`crate::labels`]). A
//! failed call is logged and counted; it never affects the update itself.

use crate::labels::{self, HttpMethod, WebhookConfig, keys};
use crate::metrics::{WEBHOOKS_FAILED_TOTAL, WEBHOOKS_SENT_TOTAL};
use crate::models::UpdateOutcome;
use anyhow::{Context, Result, anyhow};
use reqwest::{Client, RequestBuilder};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Longest response or error text kept in a log line
const LOG_MESSAGE_LIMIT: usize = 150;

/// What happened to a webhook for one outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookStatus {
    /// The workload has no webhook configured
    Skipped,
    Delivered,
    Failed,
}

/// JSON body of a POST webhook
#[derive(Debug, Serialize)]
pub struct WebhookBody<'a> {
    pub service_name: &'a str,
    pub service_id: &'a str,
    pub service_short_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<&'a str>,
    pub old_image: String,
    pub new_image: String,
}

impl<'a> WebhookBody<'a> {
    pub fn from_outcome(outcome: &'a UpdateOutcome) -> Self {
        Self {
            service_name: &outcome.workload.name,
            service_id: &outcome.workload.id,
            service_short_id: &outcome.workload.short_id,
            namespace: outcome.workload.namespace.as_deref(),
            old_image: outcome.previous_image.to_string(),
            new_image: outcome.new_image.to_string(),
        }
    }
}

pub struct WebhookDispatcher {
    client: Client,
}

impl WebhookDispatcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Fire the webhook configured on the updated workload, if any.
    pub async fn trigger(&self, outcome: &UpdateOutcome) -> WebhookStatus {
        let workload = &outcome.workload;
        let config = WebhookConfig::from_labels(&workload.name, &workload.labels);

        if !config.is_active() {
            debug!("{}: No webhook configured", workload.name);
            return WebhookStatus::Skipped;
        }

        match self.send(&config, outcome).await {
            Ok(()) => {
                WEBHOOKS_SENT_TOTAL.inc();
                WebhookStatus::Delivered
            },
            Err(e) => {
                error!(
                    "{}: Webhook failed: {}",
                    workload.name,
                    short_msg(&e.to_string(), LOG_MESSAGE_LIMIT)
                );
                WEBHOOKS_FAILED_TOTAL.inc();
                WebhookStatus::Failed
            },
        }
    }

    async fn send(&self, config: &WebhookConfig, outcome: &UpdateOutcome) -> Result<()> {
        let name = &outcome.workload.name;
        let url = config
            .url
            .as_ref()
            .ok_or_else(|| anyhow!("Webhook URL not configured"))?;

        let request = match config.method {
            HttpMethod::Get => self.client.get(url.clone()),
            HttpMethod::Post => self
                .client
                .post(url.clone())
                .json(&WebhookBody::from_outcome(outcome)),
        };
        let request = apply_auth(name, config, request.timeout(config.timeout));

        info!("{}: Calling webhook {:?} {}", name, config.method, url);
        let response = request.send().await.context("HTTP request failed")?;

        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read response".to_string());

        if !status.is_success() {
            return Err(anyhow!("Webhook returned status {}: {}", status, text));
        }

        info!(
            "{}: Webhook returned {}: {}",
            name,
            status,
            short_msg(&text, LOG_MESSAGE_LIMIT)
        );
        Ok(())
    }
}

/// Add basic auth and the token header. When both target `Authorization`,
/// basic auth wins and the token is dropped.
fn apply_auth(name: &str, config: &WebhookConfig, mut request: RequestBuilder) -> RequestBuilder {
    if let Some(basic) = &config.basic_auth {
        request = request.basic_auth(&basic.username, basic.password.as_ref());
    }

    if let Some(token) = &config.token_auth {
        if config.token_conflicts_with_basic() {
            warn!(
                "{}: W001: {} and {} both set the {} header. Ignoring the token.",
                name,
                labels::label(keys::BASIC_USERNAME),
                labels::label(keys::TOKEN_TOKEN),
                token.header
            );
        } else {
            request = request.header(token.header.as_str(), token.header_value());
        }
    }

    request
}

/// Truncate `msg` to `limit` characters, marking the cut with `..`.
pub fn short_msg(msg: &str, limit: usize) -> String {
    if msg.chars().count() > limit {
        format!("{}..", msg.chars().take(limit).collect::<String>())
    } else {
        msg.to_string()
    }
}
