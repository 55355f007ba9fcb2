//! Dedup gate: at-most-once admission per exact transition.
//!
//! The key records the event kind, the tracking identity and the exact
//! before/after stock and price. It is serialized as JSON (absent previous
//! values become `null`) and hashed, so identities containing delimiter-like
//! text can never collide with another tuple.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreResult;
use crate::traits::StateStore;
use crate::types::{EventKind, TrackingIdentity};

/// Before/after pair of an observed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition<T> {
    pub from: Option<T>,
    pub to: T,
}

/// Structured dedup key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupKey {
    pub kind: EventKind,
    pub identity: TrackingIdentity,
    pub stock: Transition<u32>,
    pub price: Transition<u64>,
}

impl DedupKey {
    /// Deterministic store key: `dedupe:event:<sha256 of the JSON tuple>`.
    pub fn encode(&self) -> String {
        let tuple = serde_json::json!([self.kind, self.identity, self.stock, self.price]);
        let mut hasher = Sha256::new();
        hasher.update(tuple.to_string().as_bytes());
        format!("dedupe:event:{}", hex::encode(hasher.finalize()))
    }
}

/// Admission control in front of the notification batcher.
pub struct DedupGate<S: ?Sized> {
    store: Arc<S>,
    cooldown: Duration,
}

impl<S: StateStore + ?Sized> DedupGate<S> {
    pub fn new(store: Arc<S>, cooldown: Duration) -> Self {
        Self { store, cooldown }
    }

    /// Claim the transition. Store failures propagate so the caller can
    /// decide; they are never turned into an admission or a silent drop.
    pub async fn admit(
        &self,
        kind: EventKind,
        identity: &TrackingIdentity,
        prev_stock: Option<u32>,
        curr_stock: u32,
        prev_price: Option<u64>,
        curr_price: u64,
    ) -> StoreResult<bool> {
        let key = DedupKey {
            kind,
            identity: identity.clone(),
            stock: Transition { from: prev_stock, to: curr_stock },
            price: Transition { from: prev_price, to: curr_price },
        };
        self.store.admit(&key.encode(), self.cooldown).await
    }
}
