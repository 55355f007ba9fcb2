pub mod batcher;
pub mod email;
pub mod format;
pub mod slack;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{NotifyError, NotifyResult};
use crate::traits::NotificationSink;
use crate::types::Notification;

pub use batcher::{BatcherHandle, FlushReport, NotificationBatcher};
pub use email::{EmailOptions, PostmarkEmailSink};
pub use format::{render_batch, render_message, OutboundMessage};
pub use slack::SlackWebhookSink;

/// Delivers to every inner sink; one failing sink does not stop the others.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }

    fn combine(&self, errors: Vec<NotifyError>) -> NotifyResult<()> {
        let failed = errors.len();
        match errors.into_iter().next() {
            None => Ok(()),
            Some(first) => Err(NotifyError::Partial {
                failed,
                total: self.sinks.len(),
                first: Box::new(first),
            }),
        }
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    async fn send_immediate(&self, channel: &str, item: &Notification) -> NotifyResult<()> {
        let mut errors = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.send_immediate(channel, item).await {
                errors.push(e);
            }
        }
        self.combine(errors)
    }

    async fn send_batch(&self, channel: &str, items: &[Notification]) -> NotifyResult<()> {
        let mut errors = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.send_batch(channel, items).await {
                errors.push(e);
            }
        }
        self.combine(errors)
    }
}
