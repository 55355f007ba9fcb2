//! Per-channel notification batching.
//!
//! [`NotificationBatcher`] is the plain queue map. [`BatcherHandle`] runs it
//! inside a task that owns the map for the scheduler's lifetime; the pipeline
//! sends it admitted notifications and the scheduler asks it to flush a
//! channel once that channel's poll pass is complete.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::traits::NotificationSink;
use crate::types::Notification;

/// Ordered per-channel queues of admitted notifications.
#[derive(Debug, Default)]
pub struct NotificationBatcher {
    queues: HashMap<String, Vec<Notification>>,
}

impl NotificationBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `item`, or hand it back when its kind must go out immediately.
    pub fn push(&mut self, item: Notification) -> Option<Notification> {
        if item.kind.is_urgent() {
            return Some(item);
        }
        self.queues.entry(item.channel.clone()).or_default().push(item);
        None
    }

    /// Drain a channel's queue in arrival order.
    pub fn take(&mut self, channel: &str) -> Vec<Notification> {
        self.queues.remove(channel).unwrap_or_default()
    }

    /// Drain every non-empty queue, ordered by channel name.
    pub fn take_all(&mut self) -> Vec<(String, Vec<Notification>)> {
        let mut all: Vec<_> = self
            .queues
            .drain()
            .filter(|(_, items)| !items.is_empty())
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn pending(&self, channel: &str) -> usize {
        self.queues.get(channel).map(Vec::len).unwrap_or(0)
    }
}

/// Outcome of flushing one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub items: usize,
    pub delivered: bool,
}

enum BatcherCommand {
    Enqueue(Notification),
    Flush {
        channel: String,
        done: oneshot::Sender<FlushReport>,
    },
}

/// Cloneable handle to the batching task.
#[derive(Clone)]
pub struct BatcherHandle {
    tx: mpsc::UnboundedSender<BatcherCommand>,
}

impl BatcherHandle {
    /// Start the batching task. Once every handle is dropped it delivers
    /// whatever is still queued and stops.
    pub fn spawn(sink: Arc<dyn NotificationSink>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_batcher(rx, sink));
        (Self { tx }, task)
    }

    /// Hand an admitted notification to the batcher.
    pub fn enqueue(&self, item: Notification) {
        if let Err(err) = self.tx.send(BatcherCommand::Enqueue(item)) {
            let BatcherCommand::Enqueue(item) = err.0 else {
                return;
            };
            error!(
                identity = %item.identity,
                kind = %item.kind,
                "Batcher stopped, notification dropped"
            );
        }
    }

    /// Send everything queued for `channel` and wait for delivery to finish.
    pub async fn flush(&self, channel: &str) -> FlushReport {
        let (done, wait) = oneshot::channel();
        let cmd = BatcherCommand::Flush {
            channel: channel.to_string(),
            done,
        };
        if self.tx.send(cmd).is_err() {
            error!(channel = %channel, "Batcher stopped, cannot flush");
            return FlushReport::default();
        }
        wait.await.unwrap_or_default()
    }
}

async fn run_batcher(mut rx: mpsc::UnboundedReceiver<BatcherCommand>, sink: Arc<dyn NotificationSink>) {
    let mut batcher = NotificationBatcher::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            BatcherCommand::Enqueue(item) => {
                let Some(urgent) = batcher.push(item) else {
                    continue;
                };
                match sink.send_immediate(&urgent.channel, &urgent).await {
                    Ok(()) => info!(
                        channel = %urgent.channel,
                        identity = %urgent.identity,
                        kind = %urgent.kind,
                        "Immediate notification sent"
                    ),
                    Err(e) => warn!(
                        channel = %urgent.channel,
                        identity = %urgent.identity,
                        error = %e,
                        "Immediate notification failed"
                    ),
                }
            }
            BatcherCommand::Flush { channel, done } => {
                let items = batcher.take(&channel);
                let report = if items.is_empty() {
                    debug!(channel = %channel, "Nothing to flush");
                    FlushReport { items: 0, delivered: true }
                } else {
                    match sink.send_batch(&channel, &items).await {
                        Ok(()) => {
                            info!(channel = %channel, items = items.len(), "Batch sent");
                            FlushReport { items: items.len(), delivered: true }
                        }
                        Err(e) => {
                            warn!(channel = %channel, items = items.len(), error = %e, "Batch delivery failed");
                            FlushReport { items: items.len(), delivered: false }
                        }
                    }
                };
                // Receiver gone means the poll pass was abandoned.
                let _ = done.send(report);
            }
        }
    }

    for (channel, items) in batcher.take_all() {
        match sink.send_batch(&channel, &items).await {
            Ok(()) => info!(channel = %channel, items = items.len(), "Pending batch sent on shutdown"),
            Err(e) => error!(
                channel = %channel,
                items = items.len(),
                error = %e,
                "Pending batch lost on shutdown"
            ),
        }
    }

    debug!("Batcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingSink;
    use crate::types::{EventKind, TrackingIdentity};

    fn item(channel: &str, kind: EventKind, id: &str) -> Notification {
        Notification {
            channel: channel.to_string(),
            kind,
            identity: TrackingIdentity::new(id),
            variant_tag: None,
            text: format!("[{kind}] ¥15,000 stock 1\n{id}"),
        }
    }

    #[test]
    fn urgent_items_bypass_queue() {
        let mut batcher = NotificationBatcher::new();
        assert!(batcher.push(item("a", EventKind::NewVariantPage, "x")).is_some());
        assert!(batcher.push(item("a", EventKind::BackInStock, "y")).is_none());
        assert_eq!(batcher.pending("a"), 1);
    }

    #[test]
    fn take_drains_in_order_per_channel() {
        let mut batcher = NotificationBatcher::new();
        batcher.push(item("a", EventKind::BackInStock, "1"));
        batcher.push(item("b", EventKind::StockIncreased, "2"));
        batcher.push(item("a", EventKind::StockIncreased, "3"));

        let drained: Vec<_> = batcher.take("a").into_iter().map(|n| n.identity.to_string()).collect();
        assert_eq!(drained, vec!["1", "3"]);
        assert_eq!(batcher.pending("a"), 0);
        assert_eq!(batcher.pending("b"), 1);
    }

    #[tokio::test]
    async fn handle_sends_urgent_immediately_and_batches_the_rest() {
        let sink = Arc::new(RecordingSink::new());
        let (handle, _task) = BatcherHandle::spawn(sink.clone());

        handle.enqueue(item("PMCG", EventKind::BackInStock, "a"));
        handle.enqueue(item("PMCG", EventKind::NewVariantPage, "b"));
        handle.enqueue(item("PMCG", EventKind::StockIncreased, "c"));

        let report = handle.flush("PMCG").await;
        assert_eq!(report, FlushReport { items: 2, delivered: true });

        let immediate = sink.immediate();
        assert_eq!(immediate.len(), 1);
        assert_eq!(immediate[0].identity.as_str(), "b");

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, "PMCG");
        assert_eq!(batches[0].1.len(), 2);
    }

    #[tokio::test]
    async fn queued_items_are_delivered_when_the_last_handle_drops() {
        let sink = Arc::new(RecordingSink::new());
        let (handle, task) = BatcherHandle::spawn(sink.clone());

        handle.enqueue(item("PMCG", EventKind::BackInStock, "a"));
        handle.enqueue(item("BOX", EventKind::StockIncreased, "b"));
        handle.enqueue(item("PMCG", EventKind::StockIncreased, "c"));
        drop(handle);
        task.await.unwrap();

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].0, "BOX");
        assert_eq!(batches[1].0, "PMCG");
        assert_eq!(batches[1].1.len(), 2);
    }

    #[tokio::test]
    async fn delivery_failure_is_reported_not_raised() {
        let sink = Arc::new(RecordingSink::failing());
        let (handle, _task) = BatcherHandle::spawn(sink.clone());

        handle.enqueue(item("PMCG", EventKind::BackInStock, "a"));
        let report = handle.flush("PMCG").await;

        assert_eq!(report, FlushReport { items: 1, delivered: false });
        // Queue is cleared even when delivery fails.
        assert_eq!(handle.flush("PMCG").await, FlushReport { items: 0, delivered: true });
    }
}
