//! In-memory state store for tests and local development.
//!
//! Not durable: product state and dedup claims are lost on restart.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{StoreError, StoreResult};
use crate::traits::StateStore;
use crate::types::{ProductState, TrackingIdentity};

#[derive(Debug, Clone)]
struct Expiring {
    value: String,
    expires_at: Instant,
}

impl Expiring {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

pub struct MemoryStateStore {
    states: Mutex<HashMap<TrackingIdentity, ProductState>>,
    claims: Mutex<HashMap<String, Instant>>,
    page_hashes: Mutex<HashMap<String, Expiring>>,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> StoreResult<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|e| StoreError::Backend(e.to_string().into()))
}

fn expiry(now: Instant, ttl: Duration) -> StoreResult<Instant> {
    now.checked_add(ttl)
        .ok_or_else(|| StoreError::Backend(format!("ttl of {}s is out of range", ttl.as_secs()).into()))
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            page_hashes: Mutex::new(HashMap::new()),
        }
    }

    /// Number of tracked identities.
    pub fn state_count(&self) -> usize {
        self.states.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Number of stored dedup claims, expired ones included until pruned.
    pub fn claim_count(&self) -> usize {
        self.claims.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Number of stored page hashes, expired ones included until purged.
    pub fn page_hash_count(&self) -> usize {
        self.page_hashes.lock().map(|h| h.len()).unwrap_or(0)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get_state(&self, identity: &TrackingIdentity) -> StoreResult<Option<ProductState>> {
        Ok(lock(&self.states)?.get(identity).cloned())
    }

    async fn set_state(&self, identity: &TrackingIdentity, state: &ProductState) -> StoreResult<()> {
        lock(&self.states)?.insert(identity.clone(), state.clone());
        Ok(())
    }

    async fn clear_state(&self, identity: &TrackingIdentity) -> StoreResult<bool> {
        Ok(lock(&self.states)?.remove(identity).is_some())
    }

    async fn admit(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let expires_at = expiry(now, ttl)?;
        // Check and insert under one guard.
        let mut claims = lock(&self.claims)?;
        if claims.get(key).is_some_and(|exp| *exp > now) {
            return Ok(false);
        }
        claims.retain(|_, exp| *exp > now);
        claims.insert(key.to_string(), expires_at);
        Ok(true)
    }

    async fn page_hash(&self, page_url: &str) -> StoreResult<Option<String>> {
        let now = Instant::now();
        Ok(lock(&self.page_hashes)?
            .get(page_url)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set_page_hash(&self, page_url: &str, hash: &str, ttl: Duration) -> StoreResult<()> {
        let expires_at = expiry(Instant::now(), ttl)?;
        lock(&self.page_hashes)?.insert(
            page_url.to_string(),
            Expiring {
                value: hash.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let now = Instant::now();

        let mut claims = lock(&self.claims)?;
        let before = claims.len();
        claims.retain(|_, exp| *exp > now);
        let mut removed = before - claims.len();
        drop(claims);

        let mut hashes = lock(&self.page_hashes)?;
        let before = hashes.len();
        hashes.retain(|_, entry| entry.is_live(now));
        removed += before - hashes.len();

        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;

    #[tokio::test]
    async fn state_round_trip_and_clear() {
        let store = MemoryStateStore::new();
        let id = TrackingIdentity::new("sword-x");
        let state = ProductState {
            last_stock: Some(2),
            last_price_minor: Some(15_000),
            last_variant_tag: String::new(),
            last_event_kind: None,
            last_event_at: None,
            first_seen_at: Utc::now(),
        };

        assert!(store.get_state(&id).await.unwrap().is_none());
        store.set_state(&id, &state).await.unwrap();
        assert_eq!(store.get_state(&id).await.unwrap(), Some(state));

        assert!(store.clear_state(&id).await.unwrap());
        assert!(!store.clear_state(&id).await.unwrap());
        assert_eq!(store.state_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admission_admits_exactly_one() {
        let store = Arc::new(MemoryStateStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.admit("dedupe:event:same", Duration::from_secs(60)).await.unwrap()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 1);
        assert_eq!(store.claim_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_claims_are_dropped_on_admission() {
        let store = MemoryStateStore::new();
        for i in 0..1000 {
            let key = format!("dedupe:event:{i}");
            assert!(store.admit(&key, Duration::from_secs(1)).await.unwrap());
        }
        assert_eq!(store.claim_count(), 1000);

        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(store.admit("dedupe:event:fresh", Duration::from_secs(1)).await.unwrap());
        assert_eq!(store.claim_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_expired_claims_and_hashes() {
        let store = MemoryStateStore::new();
        store.admit("dedupe:event:short", Duration::from_secs(1)).await.unwrap();
        store.admit("dedupe:event:long", Duration::from_secs(600)).await.unwrap();
        store
            .set_page_hash("https://shop.test/collections/x?page=4", "abc", Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;

        assert_eq!(store.purge_expired().await.unwrap(), 2);
        assert_eq!(store.claim_count(), 1);
        assert_eq!(store.page_hash_count(), 0);
    }

    #[tokio::test]
    async fn oversized_ttl_is_an_error_not_a_panic() {
        let store = MemoryStateStore::new();
        assert!(store.admit("dedupe:event:forever", Duration::MAX).await.is_err());
        assert!(store
            .set_page_hash("https://shop.test/collections/x?page=1", "abc", Duration::MAX)
            .await
            .is_err());
        assert_eq!(store.claim_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn page_hash_expires() {
        let store = MemoryStateStore::new();
        store
            .set_page_hash("https://shop.test/collections/x?page=1", "abc", Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(
            store.page_hash("https://shop.test/collections/x?page=1").await.unwrap(),
            Some("abc".to_string())
        );

        tokio::time::advance(Duration::from_secs(3601)).await;

        assert!(store.page_hash("https://shop.test/collections/x?page=1").await.unwrap().is_none());
    }
}
