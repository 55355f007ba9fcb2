//! Email delivery through the Postmark HTTP API.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::error::{NotifyError, NotifyResult};
use crate::notify::format::render_batch;
use crate::traits::NotificationSink;
use crate::types::Notification;

const POSTMARK_API_URL: &str = "https://api.postmarkapp.com/email";

/// Postmark outbound email payload.
/// See: https://postmarkapp.com/developer/api/email-api
#[derive(Debug, Serialize)]
struct PostmarkEmail<'a> {
    #[serde(rename = "From")]
    from: &'a str,
    #[serde(rename = "To")]
    to: String,
    #[serde(rename = "Subject")]
    subject: &'a str,
    #[serde(rename = "TextBody")]
    text_body: &'a str,
    #[serde(rename = "MessageStream")]
    message_stream: &'a str,
}

#[derive(Debug, Clone)]
pub struct EmailOptions {
    pub server_token: String,
    pub from: String,
    pub to: Vec<String>,
}

pub struct PostmarkEmailSink {
    client: reqwest::Client,
    options: EmailOptions,
}

impl PostmarkEmailSink {
    pub fn new(options: EmailOptions) -> NotifyResult<Self> {
        if options.server_token.is_empty() {
            return Err(NotifyError::NotConfigured("POSTMARK_SERVER_TOKEN"));
        }
        if options.from.is_empty() {
            return Err(NotifyError::NotConfigured("EMAIL_FROM"));
        }
        if options.to.is_empty() {
            return Err(NotifyError::NotConfigured("EMAIL_TO"));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            options,
        })
    }

    fn payload<'a>(&'a self, subject: &'a str, body: &'a str) -> PostmarkEmail<'a> {
        PostmarkEmail {
            from: &self.options.from,
            to: self.options.to.join(", "),
            subject,
            text_body: body,
            message_stream: "outbound",
        }
    }

    async fn send(&self, subject: &str, body: &str) -> NotifyResult<()> {
        let response = self
            .client
            .post(POSTMARK_API_URL)
            .header("Accept", "application/json")
            .header("X-Postmark-Server-Token", &self.options.server_token)
            .json(&self.payload(subject, body))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                transport: "postmark",
                status: status.as_u16(),
                body,
            });
        }

        tracing::info!(subject = %subject, recipients = self.options.to.len(), "Email sent");
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for PostmarkEmailSink {
    async fn send_batch(&self, channel: &str, items: &[Notification]) -> NotifyResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let message = render_batch(channel, items);
        self.send(&message.subject, &message.body).await
    }
}
