use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::error::{NotifyError, NotifyResult};
use crate::notify::format::render_batch;
use crate::traits::NotificationSink;
use crate::types::Notification;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Chat webhook sink (Slack incoming-webhook compatible).
///
/// With no webhook URL configured, messages are written to the log instead.
pub struct SlackWebhookSink {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl SlackWebhookSink {
    pub fn new(webhook_url: Option<String>) -> NotifyResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.filter(|u| !u.trim().is_empty()),
        })
    }

    async fn post(&self, text: &str) -> NotifyResult<()> {
        let Some(url) = &self.webhook_url else {
            tracing::info!(target: "stockwatch::notify", "{}", text);
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(&WebhookPayload { text })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                transport: "slack",
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Chat text for a batch; urgent items arrive here as single-item batches.
fn message_text(channel: &str, items: &[Notification]) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    Some(render_batch(channel, items).body)
}

#[async_trait]
impl NotificationSink for SlackWebhookSink {
    async fn send_batch(&self, channel: &str, items: &[Notification]) -> NotifyResult<()> {
        match message_text(channel, items) {
            Some(text) => self.post(&text).await,
            None => Ok(()),
        }
    }
}
