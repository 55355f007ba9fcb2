use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use crate::error::{NotifyResult, SourceResult, StoreResult};
use crate::types::*;

// ============================================================================
// SNAPSHOT SOURCE: Network access + page/product parsing
// ============================================================================

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch one collection page and list the products it links to
    async fn fetch_channel_page(&self, base: &Url, page: u32) -> SourceResult<ChannelPage>;

    /// Fetch a product's current snapshot; `None` means unavailable or unparseable
    async fn fetch_product_snapshot(&self, url: &Url) -> SourceResult<Option<ProductSnapshot>>;

    /// Highest page number advertised by the collection's pagination
    async fn detect_max_page(&self, base: &Url) -> SourceResult<Option<u32>>;
}

// ============================================================================
// STATE STORE: Durable product state + ephemeral coordination
// ============================================================================

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_state(&self, identity: &TrackingIdentity) -> StoreResult<Option<ProductState>>;

    async fn set_state(&self, identity: &TrackingIdentity, state: &ProductState) -> StoreResult<()>;

    /// Administrative removal; returns whether a record existed
    async fn clear_state(&self, identity: &TrackingIdentity) -> StoreResult<bool>;

    /// Atomically create `key` with expiry `ttl` if absent (or expired).
    ///
    /// Returns `true` only for the call that created the record.
    async fn admit(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Cached content hash of a collection page
    async fn page_hash(&self, page_url: &str) -> StoreResult<Option<String>>;

    async fn set_page_hash(&self, page_url: &str, hash: &str, ttl: Duration) -> StoreResult<()>;

    /// Drop expired dedup claims and page hashes. Returns entries removed.
    async fn purge_expired(&self) -> StoreResult<u64>;
}

// ============================================================================
// NOTIFICATION SINK: Outbound delivery (chat, email)
// ============================================================================

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Send an urgent notification on its own
    async fn send_immediate(&self, channel: &str, item: &Notification) -> NotifyResult<()> {
        self.send_batch(channel, std::slice::from_ref(item)).await
    }

    /// Send a channel's accumulated notifications as one message
    async fn send_batch(&self, channel: &str, items: &[Notification]) -> NotifyResult<()>;
}
