use crate::types::{DetectorFlags, EventKind, ProductSnapshot, ProductState};

/// Decide which event, if any, `curr` represents relative to `prev`.
///
/// Rules are evaluated in order and the first match wins. A price change
/// consumes the decision even when stock moved in the same poll.
pub fn decide(
    prev: Option<&ProductState>,
    curr: &ProductSnapshot,
    flags: DetectorFlags,
) -> Option<EventKind> {
    // A record without a stock reading counts as never observed.
    let Some((prev, prev_stock)) = prev.and_then(|p| p.last_stock.map(|s| (p, s))) else {
        return Some(if curr.variant_tag.is_some() {
            EventKind::NewVariantPage
        } else {
            EventKind::FirstSeen
        });
    };

    if let Some(tag) = curr.variant_tag.as_deref() {
        if tag != prev.last_variant_tag {
            return Some(EventKind::NewVariantPage);
        }
    }

    if let Some(prev_price) = prev.last_price_minor {
        if prev_price != curr.price_minor {
            return Some(EventKind::PriceChanged);
        }
    }

    if prev_stock == 0 && curr.stock > 0 {
        return Some(EventKind::BackInStock);
    }

    // Whole units only, so any increase is at least one.
    if curr.stock > prev_stock {
        return Some(EventKind::StockIncreased);
    }

    if flags.notify_on_stock_decrease && prev_stock > curr.stock && curr.stock > 0 {
        return Some(EventKind::StockDecreased);
    }

    if flags.notify_on_sold_out && prev_stock > 0 && curr.stock == 0 {
        return Some(EventKind::SoldOut);
    }

    None
}
