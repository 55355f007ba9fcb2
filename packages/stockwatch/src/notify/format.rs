//! Notification text rendering.
//!
//! Every admitted event becomes a short multi-line entry:
//!
//! ```text
//! [BackInStock] ¥15,000 stock 2
//! Charizard ex SAR #1384
//! https://shop.example/products/charizard-ex-sar
//! Previous stock: 0
//! ```
//!
//! Batches join entries under a channel header. The bracketed header line of
//! ordinary kinds is dropped inside a batch; structurally novel kinds keep it.

use regex::Regex;
use std::sync::LazyLock;

use crate::types::{EventKind, Notification, ProductSnapshot};

static RE_BLANK_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

/// Subject and body of one outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub subject: String,
    pub body: String,
}

/// `¥1,234,567`, with a leading `-` for negatives.
pub fn format_yen(amount: i128) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if amount < 0 {
        format!("-¥{grouped}")
    } else {
        format!("¥{grouped}")
    }
}

fn header_line(kind: EventKind, snapshot: &ProductSnapshot) -> String {
    format!(
        "[{}] {} stock {}",
        kind,
        format_yen(snapshot.price_minor.into()),
        snapshot.stock
    )
}

/// Render the text of a single notification.
pub fn render_message(
    kind: EventKind,
    snapshot: &ProductSnapshot,
    prev_stock: Option<u32>,
    prev_price: Option<u64>,
) -> String {
    let mut parts = vec![
        header_line(kind, snapshot),
        snapshot.title.clone(),
        snapshot.url.clone(),
        match prev_stock {
            Some(stock) => format!("Previous stock: {stock}"),
            None => "Previous stock: N/A".to_string(),
        },
    ];

    if let Some(prev) = prev_price.filter(|p| *p != snapshot.price_minor) {
        let delta = i128::from(snapshot.price_minor) - i128::from(prev);
        let delta_str = if delta > 0 {
            format!("+{}", format_yen(delta))
        } else {
            format_yen(delta)
        };
        parts.push(format!(
            "Previous price: {} → {}",
            format_yen(prev.into()),
            delta_str
        ));
    }

    parts.join("\n")
}

/// Entry text inside a batch: trimmed, blank lines removed, and the header
/// line dropped for ordinary kinds.
fn batch_entry(item: &Notification) -> String {
    let mut lines: Vec<&str> = item
        .text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if !item.kind.is_structurally_novel() && lines.first().is_some_and(|l| l.starts_with('[')) {
        lines.remove(0);
    }

    lines.join("\n")
}

/// Subject for a batch of notifications from `channel`.
pub fn batch_subject(channel: &str, items: &[Notification]) -> String {
    match items {
        [single] if single.kind.is_urgent() => match single.variant_tag.as_deref() {
            Some(tag) => format!("#{tag} listing added"),
            None => format!("[{channel}] {} listing added", single.kind),
        },
        _ => format!("[{channel}] Stock/price changes ({} items)", items.len()),
    }
}

/// Render a whole batch into one message.
pub fn render_batch(channel: &str, items: &[Notification]) -> OutboundMessage {
    let mut lines = vec![
        format!("[{channel}] stock/price change notification"),
        format!("Changes: {}", items.len()),
        String::new(),
    ];

    for item in items {
        let entry = batch_entry(item);
        if !entry.is_empty() {
            lines.push(entry);
            lines.push(String::new());
        }
    }

    let joined = lines.join("\n");
    let body = RE_BLANK_RUNS.replace_all(&joined, "\n\n").trim().to_string();

    OutboundMessage {
        subject: batch_subject(channel, items),
        body,
    }
}
