//! Testing utilities including mock implementations.
//!
//! These let the pipeline and scheduler run without network access or a
//! database: a scripted [`MockSnapshotSource`], a [`RecordingSink`] that keeps
//! everything it was asked to deliver, and a [`FaultyStateStore`] that fails
//! selected operations on demand.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use url::Url;

use crate::error::{NotifyError, NotifyResult, SourceError, SourceResult, StoreError, StoreResult};
use crate::source::page_url;
use crate::storage::MemoryStateStore;
use crate::traits::{NotificationSink, SnapshotSource, StateStore};
use crate::types::{ChannelPage, Notification, ProductSnapshot, ProductState, TrackingIdentity};

// ============================================================================
// MockSnapshotSource
// ============================================================================

/// Record of a call made to the mock source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockSourceCall {
    Page { base: String, page: u32 },
    Product { url: String },
    DetectMaxPage { base: String },
}

/// A scripted snapshot source.
///
/// Pages and products can be replaced between polls to simulate a shop
/// changing over time.
#[derive(Default)]
pub struct MockSnapshotSource {
    /// (base, page) -> (content hash, product URLs)
    pages: RwLock<HashMap<(String, u32), (String, Vec<String>)>>,

    /// Product URL -> current snapshot
    products: RwLock<HashMap<String, ProductSnapshot>>,

    /// Product URLs that fail with an HTTP status error
    failing: RwLock<HashSet<String>>,

    /// Delay applied to every product fetch
    product_delay: RwLock<Option<Duration>>,

    /// Per-URL delays, on top of `product_delay`
    slow_products: RwLock<HashMap<String, Duration>>,

    max_page: RwLock<Option<u32>>,

    calls: RwLock<Vec<MockSourceCall>>,
}

impl MockSnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Define a collection page listing `products` with the given content hash.
    pub fn with_page(self, base: &Url, page: u32, hash: &str, products: &[&str]) -> Self {
        self.set_page(base, page, hash, products);
        self
    }

    /// Add a product snapshot, addressed by its `url`.
    pub fn with_product(self, snapshot: ProductSnapshot) -> Self {
        self.set_product(snapshot);
        self
    }

    pub fn with_max_page(self, max_page: u32) -> Self {
        *self.max_page.write().unwrap() = Some(max_page);
        self
    }

    /// Delay every product fetch (for timeout tests).
    pub fn with_product_delay(self, delay: Duration) -> Self {
        *self.product_delay.write().unwrap() = Some(delay);
        self
    }

    pub fn set_page(&self, base: &Url, page: u32, hash: &str, products: &[&str]) {
        self.pages.write().unwrap().insert(
            (base.to_string(), page),
            (
                hash.to_string(),
                products.iter().map(|p| p.to_string()).collect(),
            ),
        );
    }

    pub fn set_product(&self, snapshot: ProductSnapshot) {
        self.products
            .write()
            .unwrap()
            .insert(snapshot.url.clone(), snapshot);
    }

    /// Delay fetches of one product only.
    pub fn delay_product(&self, url: &str, delay: Duration) {
        self.slow_products
            .write()
            .unwrap()
            .insert(url.to_string(), delay);
    }

    pub fn fail_product(&self, url: &str) {
        self.failing.write().unwrap().insert(url.to_string());
    }

    /// Number of product fetches made so far.
    pub fn product_fetches(&self) -> usize {
        self.calls
            .read()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, MockSourceCall::Product { .. }))
            .count()
    }

    pub fn clear_calls(&self) {
        self.calls.write().unwrap().clear();
    }

    fn record(&self, call: MockSourceCall) {
        self.calls.write().unwrap().push(call);
    }
}

#[async_trait]
impl SnapshotSource for MockSnapshotSource {
    async fn fetch_channel_page(&self, base: &Url, page: u32) -> SourceResult<ChannelPage> {
        self.record(MockSourceCall::Page {
            base: base.to_string(),
            page,
        });

        let url = page_url(base, page);
        let entry = self
            .pages
            .read()
            .unwrap()
            .get(&(base.to_string(), page))
            .cloned();

        let Some((hash, products)) = entry else {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: 404,
            });
        };

        let product_urls = products
            .iter()
            .map(|p| {
                Url::parse(p).map_err(|_| SourceError::InvalidUrl { url: p.clone() })
            })
            .collect::<SourceResult<Vec<_>>>()?;

        Ok(ChannelPage {
            url,
            content_hash: hash,
            product_urls,
        })
    }

    async fn fetch_product_snapshot(&self, url: &Url) -> SourceResult<Option<ProductSnapshot>> {
        self.record(MockSourceCall::Product {
            url: url.to_string(),
        });

        let delay = *self.product_delay.read().unwrap();
        let slow = self.slow_products.read().unwrap().get(url.as_str()).copied();
        for delay in [delay, slow].into_iter().flatten() {
            tokio::time::sleep(delay).await;
        }

        if self.failing.read().unwrap().contains(url.as_str()) {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: 503,
            });
        }

        Ok(self.products.read().unwrap().get(url.as_str()).cloned())
    }

    async fn detect_max_page(&self, base: &Url) -> SourceResult<Option<u32>> {
        self.record(MockSourceCall::DetectMaxPage {
            base: base.to_string(),
        });
        Ok(*self.max_page.read().unwrap())
    }
}

// ============================================================================
// RecordingSink
// ============================================================================

/// A sink that records deliveries, optionally failing every one of them.
#[derive(Default)]
pub struct RecordingSink {
    immediate: RwLock<Vec<Notification>>,
    batches: RwLock<Vec<(String, Vec<Notification>)>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose deliveries all fail (nothing is recorded).
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Notifications sent on their own, in order.
    pub fn immediate(&self) -> Vec<Notification> {
        self.immediate.read().unwrap().clone()
    }

    /// Batches sent, as (channel, items).
    pub fn batches(&self) -> Vec<(String, Vec<Notification>)> {
        self.batches.read().unwrap().clone()
    }

    /// Every delivered notification, immediate ones first.
    pub fn all(&self) -> Vec<Notification> {
        let mut all = self.immediate();
        all.extend(self.batches().into_iter().flat_map(|(_, items)| items));
        all
    }

    fn rejected() -> NotifyError {
        NotifyError::Rejected {
            transport: "recording",
            status: 500,
            body: "configured to fail".to_string(),
        }
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send_immediate(&self, _channel: &str, item: &Notification) -> NotifyResult<()> {
        if self.fail {
            return Err(Self::rejected());
        }
        self.immediate.write().unwrap().push(item.clone());
        Ok(())
    }

    async fn send_batch(&self, channel: &str, items: &[Notification]) -> NotifyResult<()> {
        if self.fail {
            return Err(Self::rejected());
        }
        self.batches
            .write()
            .unwrap()
            .push((channel.to_string(), items.to_vec()));
        Ok(())
    }
}

// ============================================================================
// FaultyStateStore
// ============================================================================

/// Wraps a [`MemoryStateStore`] and fails chosen operations on demand.
#[derive(Default)]
pub struct FaultyStateStore {
    inner: Arc<MemoryStateStore>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_admit: AtomicBool,
    fail_page_hash: AtomicBool,
}

impl FaultyStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &Arc<MemoryStateStore> {
        &self.inner
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_admit(&self, fail: bool) {
        self.fail_admit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_page_hash(&self, fail: bool) {
        self.fail_page_hash.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, op: &str) -> StoreResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(format!("injected {op} failure").into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FaultyStateStore {
    async fn get_state(&self, identity: &TrackingIdentity) -> StoreResult<Option<ProductState>> {
        Self::check(&self.fail_reads, "read")?;
        self.inner.get_state(identity).await
    }

    async fn set_state(&self, identity: &TrackingIdentity, state: &ProductState) -> StoreResult<()> {
        Self::check(&self.fail_writes, "write")?;
        self.inner.set_state(identity, state).await
    }

    async fn clear_state(&self, identity: &TrackingIdentity) -> StoreResult<bool> {
        Self::check(&self.fail_writes, "write")?;
        self.inner.clear_state(identity).await
    }

    async fn admit(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        Self::check(&self.fail_admit, "admit")?;
        self.inner.admit(key, ttl).await
    }

    async fn page_hash(&self, page_url: &str) -> StoreResult<Option<String>> {
        Self::check(&self.fail_page_hash, "page hash")?;
        self.inner.page_hash(page_url).await
    }

    async fn set_page_hash(&self, page_url: &str, hash: &str, ttl: Duration) -> StoreResult<()> {
        Self::check(&self.fail_page_hash, "page hash")?;
        self.inner.set_page_hash(page_url, hash, ttl).await
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        Self::check(&self.fail_writes, "write")?;
        self.inner.purge_expired().await
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// A snapshot with the given handle, stock and price; URL derived from the
/// handle under `https://shop.test/products/`.
pub fn snapshot(handle: &str, title: &str, stock: u32, price_minor: u64) -> ProductSnapshot {
    ProductSnapshot {
        handle: Some(handle.to_string()),
        product_id: None,
        url: format!("https://shop.test/products/{handle}"),
        title: title.to_string(),
        stock,
        price_minor,
        variant_tag: crate::identity::extract_variant_tag(title),
    }
}
