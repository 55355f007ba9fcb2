//! Per-product processing: identity, prior state, detection, admission,
//! dispatch and the final state write.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::dedup::DedupGate;
use crate::detector::decide;
use crate::error::PipelineError;
use crate::identity::resolve;
use crate::notify::format::render_message;
use crate::notify::BatcherHandle;
use crate::traits::StateStore;
use crate::types::{
    DetectorFlags, DispatchPolicy, EventKind, Notification, ProductSnapshot, ProductState,
    TrackingIdentity,
};

/// Knobs the pipeline reads on every product.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    /// Products priced below this (yen) are ignored
    pub price_threshold: u64,
    pub dedup_cooldown: Duration,
    pub flags: DetectorFlags,
    pub policy: DispatchPolicy,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            price_threshold: 10_000,
            dedup_cooldown: Duration::from_secs(180),
            flags: DetectorFlags::default(),
            policy: DispatchPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    BelowThreshold,
    NoIdentity,
}

/// What happened to one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProductOutcome {
    Skipped(SkipReason),
    Observed {
        identity: TrackingIdentity,
        event: Option<EventKind>,
        admitted: bool,
        dispatched: bool,
    },
}

impl ProductOutcome {
    pub fn event(&self) -> Option<EventKind> {
        match self {
            ProductOutcome::Observed { event, .. } => *event,
            ProductOutcome::Skipped(_) => None,
        }
    }

    pub fn dispatched(&self) -> bool {
        matches!(self, ProductOutcome::Observed { dispatched: true, .. })
    }
}

pub struct ProductPipeline {
    store: Arc<dyn StateStore>,
    gate: DedupGate<dyn StateStore>,
    batcher: BatcherHandle,
    settings: PipelineSettings,
}

impl ProductPipeline {
    pub fn new(store: Arc<dyn StateStore>, batcher: BatcherHandle, settings: PipelineSettings) -> Self {
        let gate = DedupGate::new(store.clone(), settings.dedup_cooldown);
        Self {
            store,
            gate,
            batcher,
            settings,
        }
    }

    /// Process one observed snapshot for `channel`.
    ///
    /// Only a failed state read aborts; admission and final-write failures are
    /// logged and the product still completes.
    pub async fn process(
        &self,
        channel: &str,
        snapshot: &ProductSnapshot,
    ) -> Result<ProductOutcome, PipelineError> {
        if snapshot.price_minor < self.settings.price_threshold {
            return Ok(ProductOutcome::Skipped(SkipReason::BelowThreshold));
        }

        let Some(identity) = resolve(snapshot) else {
            debug!(url = %snapshot.url, "No usable identity, skipping");
            return Ok(ProductOutcome::Skipped(SkipReason::NoIdentity));
        };

        let prev = self
            .store
            .get_state(&identity)
            .await
            .map_err(|source| PipelineError::StateRead {
                identity: identity.to_string(),
                source,
            })?;

        let event = decide(prev.as_ref(), snapshot, self.settings.flags);
        let prev_stock = prev.as_ref().and_then(|p| p.last_stock);
        let prev_price = prev.as_ref().and_then(|p| p.last_price_minor);

        let mut admitted = false;
        let mut dispatched = false;

        if let Some(kind) = event.filter(EventKind::is_reportable) {
            admitted = match self
                .gate
                .admit(
                    kind,
                    &identity,
                    prev_stock,
                    snapshot.stock,
                    prev_price,
                    snapshot.price_minor,
                )
                .await
            {
                Ok(admitted) => admitted,
                Err(e) => {
                    error!(
                        identity = %identity,
                        kind = %kind,
                        error = %e,
                        "Dedup admission failed, notification skipped; follow-up required"
                    );
                    false
                }
            };

            if !admitted {
                debug!(identity = %identity, kind = %kind, "Event not admitted");
            } else if self.settings.policy.allows(kind) {
                info!(
                    channel = %channel,
                    identity = %identity,
                    kind = %kind,
                    stock = snapshot.stock,
                    price = snapshot.price_minor,
                    "Change detected"
                );
                self.batcher.enqueue(Notification {
                    channel: channel.to_string(),
                    kind,
                    identity: identity.clone(),
                    variant_tag: snapshot.variant_tag.clone(),
                    text: render_message(kind, snapshot, prev_stock, prev_price),
                });
                dispatched = true;
            } else {
                debug!(identity = %identity, kind = %kind, "Suppressed by dispatch policy");
            }
        } else if event == Some(EventKind::FirstSeen) {
            debug!(identity = %identity, stock = snapshot.stock, "First observation recorded");
        }

        let next = ProductState::observe(prev.as_ref(), snapshot, event, Utc::now());
        if let Err(e) = self.store.set_state(&identity, &next).await {
            error!(identity = %identity, error = %e, "State write failed");
        }

        Ok(ProductOutcome::Observed {
            identity,
            event,
            admitted,
            dispatched,
        })
    }
}
