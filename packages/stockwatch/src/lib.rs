//! Storefront Stock Watcher
//!
//! Polls e-commerce collection pages, follows the products they list, and
//! reports when a high-value product comes back in stock, gains stock, or
//! appears as a new variant listing. Every notification passes a short-lived
//! dedup claim so concurrent or repeated polls report a transition once.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stockwatch::{BatcherHandle, MemoryStateStore, ProductPipeline, PipelineSettings};
//! use stockwatch::testing::RecordingSink;
//!
//! let store = Arc::new(MemoryStateStore::new());
//! let (batcher, _task) = BatcherHandle::spawn(Arc::new(RecordingSink::new()));
//! let pipeline = ProductPipeline::new(store, batcher.clone(), PipelineSettings::default());
//!
//! let outcome = pipeline.process("PMCG", &snapshot).await?;
//! batcher.flush("PMCG").await;
//! ```
//!
//! # Modules
//!
//! - [`traits`] - Seams to the outside world (SnapshotSource, StateStore, NotificationSink)
//! - [`types`] - Snapshots, persisted state, events, channels
//! - [`identity`] - Tracking identity resolution
//! - [`detector`] - Pure change detection
//! - [`dedup`] - At-most-once admission per transition
//! - [`pipeline`] - Per-product processing
//! - [`scheduler`] - Interval-driven channel polling
//! - [`notify`] - Message rendering, batching, chat and email sinks
//! - [`source`] - HTTP storefront source
//! - [`storage`] - In-memory and Postgres state stores
//! - [`testing`] - Mock implementations for testing

pub mod config;
pub mod dedup;
pub mod detector;
pub mod error;
pub mod identity;
pub mod notify;
pub mod pipeline;
pub mod scheduler;
pub mod source;
pub mod storage;
pub mod testing;
pub mod traits;
pub mod types;

// Re-export core types at crate root
pub use config::Config;
pub use dedup::{DedupGate, DedupKey};
pub use error::{ConfigError, NotifyError, PipelineError, SourceError, StoreError};
pub use notify::{BatcherHandle, FanoutSink, FlushReport, PostmarkEmailSink, SlackWebhookSink};
pub use pipeline::{PipelineSettings, ProductOutcome, ProductPipeline, SkipReason};
pub use scheduler::{PassSummary, PollScheduler, PollSettings};
pub use source::HttpSnapshotSource;
pub use storage::{MemoryStateStore, PostgresStateStore};
pub use traits::{NotificationSink, SnapshotSource, StateStore};
pub use types::{
    ChannelConfig, ChannelPage, DetectorFlags, DispatchPolicy, EventKind, Notification, PageSet,
    Priority, ProductSnapshot, ProductState, TrackingIdentity,
};
