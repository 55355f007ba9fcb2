use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

// ============================================================================
// SNAPSHOTS (ephemeral, one per product per poll)
// ============================================================================

/// What a single poll observed about one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub handle: Option<String>,
    pub product_id: Option<String>,
    pub url: String,
    pub title: String,
    /// Units currently purchasable ("available, quantity unknown" counts as 1)
    pub stock: u32,
    /// Price in yen (no fractional subunit)
    pub price_minor: u64,
    /// Four-digit `#NNNN` tag from the title, if any
    pub variant_tag: Option<String>,
}

/// Resolved key for state and dedup lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackingIdentity(String);

impl TrackingIdentity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// PERSISTED STATE
// ============================================================================

/// Last known state of one tracked identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductState {
    pub last_stock: Option<u32>,
    pub last_price_minor: Option<u64>,
    /// Empty when the last observation carried no tag
    pub last_variant_tag: String,
    pub last_event_kind: Option<EventKind>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
}

impl ProductState {
    /// State after observing `snapshot`, carrying the audit trail forward.
    ///
    /// The audit fields move only when a reportable event was detected;
    /// `FirstSeen` leaves them unset.
    pub fn observe(
        prev: Option<&ProductState>,
        snapshot: &ProductSnapshot,
        event: Option<EventKind>,
        now: DateTime<Utc>,
    ) -> Self {
        let (last_event_kind, last_event_at) = match event {
            Some(kind) if kind != EventKind::FirstSeen => (Some(kind), Some(now)),
            _ => (
                prev.and_then(|p| p.last_event_kind),
                prev.and_then(|p| p.last_event_at),
            ),
        };

        Self {
            last_stock: Some(snapshot.stock),
            last_price_minor: Some(snapshot.price_minor),
            last_variant_tag: snapshot.variant_tag.clone().unwrap_or_default(),
            last_event_kind,
            last_event_at,
            first_seen_at: prev.map(|p| p.first_seen_at).unwrap_or(now),
        }
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    FirstSeen,
    NewVariantPage,
    PriceChanged,
    BackInStock,
    StockIncreased,
    StockDecreased,
    SoldOut,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::FirstSeen,
        EventKind::NewVariantPage,
        EventKind::PriceChanged,
        EventKind::BackInStock,
        EventKind::StockIncreased,
        EventKind::StockDecreased,
        EventKind::SoldOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FirstSeen => "FirstSeen",
            EventKind::NewVariantPage => "NewVariantPage",
            EventKind::PriceChanged => "PriceChanged",
            EventKind::BackInStock => "BackInStock",
            EventKind::StockIncreased => "StockIncreased",
            EventKind::StockDecreased => "StockDecreased",
            EventKind::SoldOut => "SoldOut",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == value)
    }

    /// Urgent kinds skip the channel queue.
    pub fn is_urgent(&self) -> bool {
        matches!(self, EventKind::NewVariantPage)
    }

    /// Structurally novel kinds keep their header line inside batch bodies.
    pub fn is_structurally_novel(&self) -> bool {
        matches!(self, EventKind::NewVariantPage)
    }

    /// Whether the kind goes through dedup admission at all.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, EventKind::FirstSeen)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional detector rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectorFlags {
    pub notify_on_stock_decrease: bool,
    pub notify_on_sold_out: bool,
}

/// Which detected kinds reach the notification sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub notify_on_price_change: bool,
}

impl DispatchPolicy {
    pub fn allows(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::FirstSeen => false,
            EventKind::PriceChanged => self.notify_on_price_change,
            _ => true,
        }
    }
}

// ============================================================================
// CHANNELS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Hot,
    Normal,
    Cold,
}

impl Priority {
    /// Unknown labels fall back to `Normal`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "hot" => Priority::Hot,
            "cold" => Priority::Cold,
            _ => Priority::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Hot => "hot",
            Priority::Normal => "normal",
            Priority::Cold => "cold",
        }
    }
}

/// Canonical page selection for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageSet {
    Explicit(Vec<u32>),
    AutoDetect,
}

/// A configured collection polled as one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub name: String,
    pub base: Url,
    pub pages: PageSet,
    pub priority: Priority,
}

/// One fetched collection page.
#[derive(Debug, Clone)]
pub struct ChannelPage {
    pub url: Url,
    pub content_hash: String,
    /// Canonical product URLs in page order, deduplicated
    pub product_urls: Vec<Url>,
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

/// An admitted, formatted notification waiting for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub kind: EventKind,
    pub identity: TrackingIdentity,
    pub variant_tag: Option<String>,
    pub text: String,
}
