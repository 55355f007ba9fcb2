//! Typed errors for the watcher library.
//!
//! Uses `thiserror` for library errors; the binary wraps them in `anyhow`.

use thiserror::Error;

/// Errors raised while fetching collection pages or product data.
#[derive(Debug, Error)]
pub enum SourceError {
    /// HTTP request failed before a response arrived
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Upstream answered with a non-success status
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    /// URL could not be parsed or built
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// Product JSON did not match the expected shape
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

/// Errors raised by a state store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend failure (connection, query, lock poisoning)
    #[error("storage error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A persisted row could not be mapped back into domain types
    #[error("corrupt record for {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

/// Errors raised while delivering a notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// HTTP request to the transport failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport rejected the message
    #[error("{transport} rejected message: HTTP {status} {body}")]
    Rejected {
        transport: &'static str,
        status: u16,
        body: String,
    },

    /// Transport is enabled but missing required settings
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    /// One or more sinks of a fan-out failed
    #[error("{failed} of {total} sinks failed: {first}")]
    Partial {
        failed: usize,
        total: usize,
        first: Box<NotifyError>,
    },
}

/// Errors that abort processing of a single product.
///
/// Everything else (admission or final-write failures) is logged and the
/// product still completes.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Prior state could not be read; nothing was written
    #[error("state read failed for {identity}: {source}")]
    StateRead {
        identity: String,
        #[source]
        source: StoreError,
    },

    /// Product snapshot could not be fetched
    #[error("fetch failed for {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: SourceError,
    },

    /// Product handling exceeded its time budget
    #[error("timed out processing {url}")]
    Timeout { url: String },
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric or boolean setting could not be parsed
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    /// No channel could be built from the configuration
    #[error("no collections configured")]
    NoChannels,

    /// A channel base URL is malformed
    #[error("invalid collection URL for {channel}: {url}")]
    InvalidChannelUrl { channel: String, url: String },
}

/// Result type alias for source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for notification delivery.
pub type NotifyResult<T> = std::result::Result<T, NotifyError>;
