//! Interval-driven polling of configured channels.
//!
//! Each channel is polled when its priority interval has elapsed. A pass walks
//! the channel's pages, runs the products of every processed page through the
//! pipeline with bounded concurrency, then flushes the channel's batch.

use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::PipelineError;
use crate::notify::{BatcherHandle, FlushReport};
use crate::pipeline::{ProductOutcome, ProductPipeline};
use crate::traits::{SnapshotSource, StateStore};
use crate::types::{ChannelConfig, ChannelPage, EventKind, PageSet, Priority};

/// Pages polled when auto-detection finds nothing.
pub const DEFAULT_PAGES: [u32; 3] = [1, 2, 3];

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub hot_interval: Duration,
    pub normal_interval: Duration,
    pub cold_interval: Duration,
    /// Product fetches per second per worker
    pub rps_budget: f64,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub page_hash_ttl: Duration,
    /// Pages numbered up to this are processed on every pass
    pub hot_pages: u32,
    pub concurrency: usize,
    pub product_timeout: Duration,
    /// How often expired dedup claims and page hashes are dropped
    pub purge_interval: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            hot_interval: Duration::from_secs(20),
            normal_interval: Duration::from_secs(60),
            cold_interval: Duration::from_secs(300),
            rps_budget: 0.8,
            jitter_min_ms: 200,
            jitter_max_ms: 1200,
            page_hash_ttl: Duration::from_secs(3600),
            hot_pages: 3,
            concurrency: 4,
            product_timeout: Duration::from_secs(45),
            purge_interval: Duration::from_secs(600),
        }
    }
}

impl PollSettings {
    pub fn interval_for(&self, priority: Priority) -> Duration {
        match priority {
            Priority::Hot => self.hot_interval,
            Priority::Normal => self.normal_interval,
            Priority::Cold => self.cold_interval,
        }
    }

    pub fn is_hot_page(&self, page: u32) -> bool {
        page <= self.hot_pages
    }

    /// Pause after each product fetch: the rate budget plus random jitter.
    pub fn fetch_delay(&self) -> Duration {
        let base_ms = 1000.0 / self.rps_budget.max(0.1);
        let (lo, hi) = if self.jitter_min_ms <= self.jitter_max_ms {
            (self.jitter_min_ms, self.jitter_max_ms)
        } else {
            (self.jitter_max_ms, self.jitter_min_ms)
        };
        Duration::from_millis(base_ms as u64 + fastrand::u64(lo..=hi))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Polling,
}

/// A channel with its page set resolved.
#[derive(Debug, Clone)]
pub struct ChannelRuntime {
    pub config: ChannelConfig,
    pub pages: Vec<u32>,
    pub state: ChannelState,
    pub last_run_at: Option<Instant>,
}

/// Counters from one channel pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub channel: String,
    pub pages_processed: usize,
    pub pages_skipped: usize,
    pub page_errors: usize,
    pub products: usize,
    pub product_errors: usize,
    /// Reportable events detected (admitted or not)
    pub events: usize,
    pub dispatched: usize,
    pub flush: FlushReport,
}

impl PassSummary {
    fn record(&mut self, result: &Result<Option<ProductOutcome>, PipelineError>) {
        match result {
            Ok(Some(outcome)) => {
                self.products += 1;
                if outcome.event().is_some_and(|k| k.is_reportable()) {
                    self.events += 1;
                }
                if outcome.dispatched() {
                    self.dispatched += 1;
                }
            }
            Ok(None) => self.products += 1,
            Err(_) => self.product_errors += 1,
        }
    }
}

pub struct PollScheduler {
    source: Arc<dyn SnapshotSource>,
    store: Arc<dyn StateStore>,
    pipeline: Arc<ProductPipeline>,
    batcher: BatcherHandle,
    settings: PollSettings,
    channels: Vec<ChannelRuntime>,
    last_purge_at: Instant,
}

impl PollScheduler {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        store: Arc<dyn StateStore>,
        pipeline: Arc<ProductPipeline>,
        batcher: BatcherHandle,
        settings: PollSettings,
    ) -> Self {
        Self {
            source,
            store,
            pipeline,
            batcher,
            settings,
            channels: Vec::new(),
            last_purge_at: Instant::now(),
        }
    }

    pub fn channels(&self) -> &[ChannelRuntime] {
        &self.channels
    }

    /// Resolve page sets and register the channels. Auto-detected channels
    /// are probed once here.
    pub async fn resolve_channels(&mut self, configs: Vec<ChannelConfig>) {
        for config in configs {
            let pages = resolve_pages(self.source.as_ref(), &config).await;
            info!(
                channel = %config.name,
                pages = pages.len(),
                priority = config.priority.as_str(),
                "Channel registered"
            );
            self.channels.push(ChannelRuntime {
                config,
                pages,
                state: ChannelState::Idle,
                last_run_at: None,
            });
        }
    }

    /// Sleep between due checks: a tenth of the shortest interval, at least 1s.
    pub fn tick_interval(&self) -> Duration {
        let min = self
            .channels
            .iter()
            .map(|c| self.settings.interval_for(c.config.priority))
            .min()
            .unwrap_or(self.settings.hot_interval);
        (min / 10).max(Duration::from_secs(1))
    }

    pub fn is_due(&self, channel: &ChannelRuntime, now: Instant) -> bool {
        match channel.last_run_at {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last) >= self.settings.interval_for(channel.config.priority)
            }
        }
    }

    /// Poll every channel whose interval has elapsed.
    pub async fn tick(&mut self) -> Vec<PassSummary> {
        let now = Instant::now();
        self.purge_if_due(now).await;

        let due: Vec<usize> = (0..self.channels.len())
            .filter(|&i| self.is_due(&self.channels[i], now))
            .collect();

        let mut summaries = Vec::with_capacity(due.len());
        for idx in due {
            summaries.push(self.poll_channel(idx).await);
        }
        summaries
    }

    /// Poll forever. Errors inside a pass are logged and never end the loop.
    pub async fn run(&mut self) {
        let tick = self.tick_interval();
        info!(
            channels = self.channels.len(),
            tick_secs = tick.as_secs(),
            "Scheduler started"
        );

        loop {
            self.tick().await;
            tokio::time::sleep(tick).await;
        }
    }

    /// One pass over every channel, ignoring intervals.
    pub async fn run_once(&mut self) -> Vec<PassSummary> {
        let mut summaries = Vec::with_capacity(self.channels.len());
        for idx in 0..self.channels.len() {
            summaries.push(self.poll_channel(idx).await);
        }
        summaries
    }

    async fn purge_if_due(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_purge_at) < self.settings.purge_interval {
            return;
        }
        self.last_purge_at = now;

        match self.store.purge_expired().await {
            Ok(removed) => debug!(removed, "Expired claims and page hashes purged"),
            Err(e) => warn!(error = %e, "Failed to purge expired entries"),
        }
    }

    async fn poll_channel(&mut self, idx: usize) -> PassSummary {
        self.channels[idx].state = ChannelState::Polling;

        let channel = &self.channels[idx];
        info!(channel = %channel.config.name, "Channel pass started");
        let summary = self.poll_pass(&channel.config, &channel.pages).await;

        let channel = &mut self.channels[idx];
        channel.state = ChannelState::Idle;
        channel.last_run_at = Some(Instant::now());

        info!(
            channel = %summary.channel,
            pages = summary.pages_processed,
            skipped = summary.pages_skipped,
            products = summary.products,
            errors = summary.product_errors + summary.page_errors,
            events = summary.events,
            sent = summary.flush.items,
            "Channel pass complete"
        );
        summary
    }

    async fn poll_pass(&self, config: &ChannelConfig, pages: &[u32]) -> PassSummary {
        let mut summary = PassSummary {
            channel: config.name.clone(),
            ..Default::default()
        };

        for &page in pages {
            let fetched = match self.source.fetch_channel_page(&config.base, page).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(channel = %config.name, page, error = %e, "Page fetch failed");
                    summary.page_errors += 1;
                    continue;
                }
            };

            let changed = self.page_changed(&fetched).await;
            if !changed && !self.settings.is_hot_page(page) {
                debug!(channel = %config.name, page, "Page unchanged, skipping");
                summary.pages_skipped += 1;
                continue;
            }

            summary.pages_processed += 1;

            let results: Vec<_> = stream::iter(fetched.product_urls.iter().cloned())
                .map(|url| self.run_product(&config.name, url))
                .buffer_unordered(self.settings.concurrency.max(1))
                .collect()
                .await;

            for result in &results {
                summary.record(result);
            }

            // The hash is remembered only once every product on the page went
            // through, so failed products are retried on the next pass.
            let failed = results.iter().filter(|r| r.is_err()).count();
            if failed > 0 {
                debug!(channel = %config.name, page, failed, "Page hash not updated");
            } else if changed {
                self.remember_page_hash(&fetched).await;
            }
        }

        summary.flush = self.batcher.flush(&config.name).await;
        summary
    }

    /// Compare against the cached hash. A cache failure counts as changed.
    async fn page_changed(&self, page: &ChannelPage) -> bool {
        let key = page.url.as_str();
        match self.store.page_hash(key).await {
            Ok(Some(prev)) => prev != page.content_hash,
            Ok(None) => true,
            Err(e) => {
                warn!(url = %key, error = %e, "Page hash lookup failed");
                true
            }
        }
    }

    async fn remember_page_hash(&self, page: &ChannelPage) {
        let key = page.url.as_str();
        if let Err(e) = self
            .store
            .set_page_hash(key, &page.content_hash, self.settings.page_hash_ttl)
            .await
        {
            warn!(url = %key, error = %e, "Page hash update failed");
        }
    }

    async fn run_product(
        &self,
        channel: &str,
        url: Url,
    ) -> Result<Option<ProductOutcome>, PipelineError> {
        let work = async {
            let snapshot = self
                .source
                .fetch_product_snapshot(&url)
                .await
                .map_err(|source| PipelineError::Fetch {
                    url: url.to_string(),
                    source,
                })?;

            match snapshot {
                Some(snapshot) => self.pipeline.process(channel, &snapshot).await.map(Some),
                None => Ok(None),
            }
        };

        let result = match tokio::time::timeout(self.settings.product_timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout {
                url: url.to_string(),
            }),
        };

        match &result {
            Err(e) => warn!(channel = %channel, url = %url, error = %e, "Product skipped"),
            Ok(Some(outcome)) if outcome.event() == Some(EventKind::FirstSeen) => {
                debug!(channel = %channel, url = %url, "New product tracked");
            }
            Ok(_) => {}
        }

        tokio::time::sleep(self.settings.fetch_delay()).await;
        result
    }
}

/// Concrete pages for a channel. Auto-detection falls back to
/// [`DEFAULT_PAGES`] when the pagination yields nothing or the probe fails.
pub async fn resolve_pages(source: &dyn SnapshotSource, config: &ChannelConfig) -> Vec<u32> {
    match &config.pages {
        PageSet::Explicit(pages) => pages.clone(),
        PageSet::AutoDetect => match source.detect_max_page(&config.base).await {
            Ok(Some(max)) => {
                info!(channel = %config.name, max_page = max, "Detected page count");
                (1..=max).collect()
            }
            Ok(None) => {
                warn!(channel = %config.name, "No pagination found, using default pages");
                DEFAULT_PAGES.to_vec()
            }
            Err(e) => {
                warn!(channel = %config.name, error = %e, "Page detection failed, using default pages");
                DEFAULT_PAGES.to_vec()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineSettings;
    use crate::storage::MemoryStateStore;
    use crate::testing::{snapshot, FaultyStateStore, MockSnapshotSource, RecordingSink};

    fn base() -> Url {
        Url::parse("https://shop.test/collections/pmcg").unwrap()
    }

    fn channel(pages: PageSet, priority: Priority) -> ChannelConfig {
        ChannelConfig {
            name: "PMCG".to_string(),
            base: base(),
            pages,
            priority,
        }
    }

    fn settings() -> PollSettings {
        PollSettings {
            jitter_min_ms: 0,
            jitter_max_ms: 0,
            ..Default::default()
        }
    }

    struct Fixture {
        source: Arc<MockSnapshotSource>,
        sink: Arc<RecordingSink>,
        scheduler: PollScheduler,
    }

    async fn fixture(source: MockSnapshotSource, channels: Vec<ChannelConfig>) -> Fixture {
        fixture_with(settings(), source, channels).await
    }

    async fn fixture_with(
        settings: PollSettings,
        source: MockSnapshotSource,
        channels: Vec<ChannelConfig>,
    ) -> Fixture {
        fixture_on(Arc::new(MemoryStateStore::new()), settings, source, channels).await
    }

    async fn fixture_on(
        store: Arc<dyn StateStore>,
        settings: PollSettings,
        source: MockSnapshotSource,
        channels: Vec<ChannelConfig>,
    ) -> Fixture {
        let source = Arc::new(source);
        let sink = Arc::new(RecordingSink::new());
        let (batcher, _task) = BatcherHandle::spawn(sink.clone());
        let pipeline = Arc::new(ProductPipeline::new(
            store.clone(),
            batcher.clone(),
            PipelineSettings::default(),
        ));
        let mut scheduler = PollScheduler::new(source.clone(), store, pipeline, batcher, settings);
        scheduler.resolve_channels(channels).await;
        Fixture {
            source,
            sink,
            scheduler,
        }
    }

    #[test]
    fn fetch_delay_respects_budget_and_jitter() {
        let settings = PollSettings {
            rps_budget: 2.0,
            jitter_min_ms: 100,
            jitter_max_ms: 200,
            ..PollSettings::default()
        };
        for _ in 0..50 {
            let delay = settings.fetch_delay();
            assert!(delay >= Duration::from_millis(600) && delay <= Duration::from_millis(700));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn auto_detect_uses_detected_max_or_default() {
        let detected = fixture(
            MockSnapshotSource::new().with_max_page(5),
            vec![channel(PageSet::AutoDetect, Priority::Normal)],
        )
        .await;
        assert_eq!(detected.scheduler.channels()[0].pages, vec![1, 2, 3, 4, 5]);

        let fallback = fixture(
            MockSnapshotSource::new(),
            vec![channel(PageSet::AutoDetect, Priority::Normal)],
        )
        .await;
        assert_eq!(fallback.scheduler.channels()[0].pages, DEFAULT_PAGES.to_vec());
    }

    #[tokio::test(start_paused = true)]
    async fn tick_is_a_tenth_of_the_shortest_interval() {
        let f = fixture(
            MockSnapshotSource::new(),
            vec![
                channel(PageSet::Explicit(vec![1]), Priority::Hot),
                channel(PageSet::Explicit(vec![1]), Priority::Cold),
            ],
        )
        .await;
        assert_eq!(f.scheduler.tick_interval(), Duration::from_secs(2));

        let fast = PollSettings {
            hot_interval: Duration::from_secs(5),
            ..settings()
        };
        let f = fixture_with(
            fast,
            MockSnapshotSource::new(),
            vec![channel(PageSet::Explicit(vec![1]), Priority::Hot)],
        )
        .await;
        assert_eq!(f.scheduler.tick_interval(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_cold_pages_are_skipped_hot_pages_are_not() {
        let source = MockSnapshotSource::new()
            .with_page(&base(), 1, "h1", &["https://shop.test/products/a"])
            .with_page(&base(), 4, "h4", &["https://shop.test/products/b"])
            .with_product(snapshot("a", "A", 1, 20_000))
            .with_product(snapshot("b", "B", 1, 20_000));
        let mut f = fixture(source, vec![channel(PageSet::Explicit(vec![1, 4]), Priority::Hot)]).await;

        let first = f.scheduler.run_once().await;
        assert_eq!(first[0].pages_processed, 2);
        assert_eq!(first[0].products, 2);

        f.source.clear_calls();
        let second = f.scheduler.run_once().await;
        assert_eq!(second[0].pages_processed, 1);
        assert_eq!(second[0].pages_skipped, 1);
        assert_eq!(f.source.product_fetches(), 1);

        // A changed hash brings page 4 back.
        f.source.set_page(&base(), 4, "h4-new", &["https://shop.test/products/b"]);
        let third = f.scheduler.run_once().await;
        assert_eq!(third[0].pages_processed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn restock_across_passes_is_batched_once() {
        let source = MockSnapshotSource::new()
            .with_page(&base(), 1, "h1", &["https://shop.test/products/a"])
            .with_product(snapshot("a", "Product A", 0, 15_000));
        let mut f = fixture(source, vec![channel(PageSet::Explicit(vec![1]), Priority::Hot)]).await;

        let first = f.scheduler.run_once().await;
        assert_eq!(first[0].events, 0);

        f.source.set_product(snapshot("a", "Product A", 2, 15_000));
        let second = f.scheduler.run_once().await;
        assert_eq!(second[0].events, 1);
        assert_eq!(second[0].flush, FlushReport { items: 1, delivered: true });

        let third = f.scheduler.run_once().await;
        assert_eq!(third[0].events, 0);

        let batches = f.sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1[0].kind, EventKind::BackInStock);
    }

    #[tokio::test(start_paused = true)]
    async fn page_and_product_failures_do_not_stop_the_pass() {
        let source = MockSnapshotSource::new()
            .with_page(
                &base(),
                1,
                "h1",
                &["https://shop.test/products/a", "https://shop.test/products/b"],
            )
            .with_product(snapshot("a", "A", 1, 20_000))
            .with_product(snapshot("b", "B", 1, 20_000));
        source.fail_product("https://shop.test/products/b");
        let mut f = fixture(source, vec![channel(PageSet::Explicit(vec![1, 2]), Priority::Hot)]).await;

        let summary = f.scheduler.run_once().await;
        assert_eq!(summary[0].page_errors, 1);
        assert_eq!(summary[0].products, 1);
        assert_eq!(summary[0].product_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_products_time_out() {
        let source = MockSnapshotSource::new()
            .with_page(&base(), 1, "h1", &["https://shop.test/products/a"])
            .with_product(snapshot("a", "A", 1, 20_000))
            .with_product_delay(Duration::from_secs(120));
        let mut f = fixture(source, vec![channel(PageSet::Explicit(vec![1]), Priority::Hot)]).await;

        let summary = f.scheduler.run_once().await;
        assert_eq!(summary[0].product_errors, 1);
        assert_eq!(summary[0].products, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_products_keep_their_page_eligible_for_retry() {
        let store = Arc::new(FaultyStateStore::new());
        let source = MockSnapshotSource::new()
            .with_page(&base(), 4, "h4", &["https://shop.test/products/a"])
            .with_product(snapshot("a", "A", 0, 20_000));
        let mut f = fixture_on(
            store.clone(),
            settings(),
            source,
            vec![channel(PageSet::Explicit(vec![4]), Priority::Hot)],
        )
        .await;

        f.scheduler.run_once().await;

        f.source.set_product(snapshot("a", "A", 2, 20_000));
        f.source.set_page(&base(), 4, "h4-new", &["https://shop.test/products/a"]);
        store.fail_reads(true);
        let failed = f.scheduler.run_once().await;
        assert_eq!(failed[0].pages_processed, 1);
        assert_eq!(failed[0].product_errors, 1);

        store.fail_reads(false);
        let retried = f.scheduler.run_once().await;
        assert_eq!(retried[0].pages_processed, 1);
        assert_eq!(retried[0].pages_skipped, 0);
        assert_eq!(retried[0].events, 1);
        assert_eq!(f.sink.batches()[0].1[0].kind, EventKind::BackInStock);

        // Clean pass stored the hash, so the unchanged page is skipped again.
        let settled = f.scheduler.run_once().await;
        assert_eq!(settled[0].pages_skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn page_hash_errors_count_as_changed() {
        let store = Arc::new(FaultyStateStore::new());
        store.fail_page_hash(true);
        let source = MockSnapshotSource::new()
            .with_page(&base(), 4, "h4", &["https://shop.test/products/a"])
            .with_product(snapshot("a", "A", 1, 20_000));
        let mut f = fixture_on(
            store,
            settings(),
            source,
            vec![channel(PageSet::Explicit(vec![4]), Priority::Hot)],
        )
        .await;

        for _ in 0..2 {
            let summary = f.scheduler.run_once().await;
            assert_eq!(summary[0].pages_processed, 1);
            assert_eq!(summary[0].pages_skipped, 0);
            assert_eq!(summary[0].product_errors, 0);
        }
        assert_eq!(f.source.product_fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_product_does_not_hold_back_the_rest_of_the_page() {
        let source = MockSnapshotSource::new()
            .with_page(
                &base(),
                1,
                "h1",
                &["https://shop.test/products/a", "https://shop.test/products/b"],
            )
            .with_product(snapshot("a", "A", 0, 20_000))
            .with_product(snapshot("b", "B", 0, 20_000));
        let mut f = fixture(source, vec![channel(PageSet::Explicit(vec![1]), Priority::Hot)]).await;
        f.scheduler.run_once().await;

        f.source.delay_product("https://shop.test/products/a", Duration::from_secs(120));
        f.source.set_product(snapshot("a", "A", 3, 20_000));
        f.source.set_product(snapshot("b", "B", 2, 20_000));

        let pass = f.scheduler.run_once().await;
        assert_eq!(pass[0].product_errors, 1);
        assert_eq!(pass[0].events, 1);
        assert_eq!(pass[0].flush, FlushReport { items: 1, delivered: true });

        let batches = f.sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1[0].identity.as_str(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_purged_on_schedule() {
        let store = Arc::new(MemoryStateStore::new());
        let poll = PollSettings {
            purge_interval: Duration::from_secs(60),
            ..settings()
        };
        let source = MockSnapshotSource::new().with_page(&base(), 1, "h1", &[]);
        let mut f = fixture_on(
            store.clone(),
            poll,
            source,
            vec![channel(PageSet::Explicit(vec![1]), Priority::Hot)],
        )
        .await;

        store.admit("dedupe:event:old", Duration::from_secs(1)).await.unwrap();
        f.scheduler.tick().await;
        assert_eq!(store.claim_count(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        f.scheduler.tick().await;
        assert_eq!(store.claim_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn channels_run_only_when_due() {
        let source = MockSnapshotSource::new().with_page(&base(), 1, "h1", &[]);
        let mut f = fixture(source, vec![channel(PageSet::Explicit(vec![1]), Priority::Hot)]).await;

        assert_eq!(f.scheduler.tick().await.len(), 1);
        assert_eq!(f.scheduler.channels()[0].state, ChannelState::Idle);
        assert!(f.scheduler.tick().await.is_empty());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(f.scheduler.tick().await.len(), 1);
    }
}
