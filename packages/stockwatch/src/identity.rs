//! Tracking identity resolution.
//!
//! A product is tracked under its raw identity (handle, then id, then the
//! `/products/<segment>` of its URL, then the URL itself). Listings whose title
//! carries a `#NNNN` tag are tracked separately per tag, so several high-value
//! pages sharing one handle never overwrite each other's state.

use regex::Regex;
use std::sync::LazyLock;
use url::Url;

use crate::types::{ProductSnapshot, TrackingIdentity};

static RE_VARIANT_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"#(\d{4})").unwrap());

/// First `#` followed by four digits in `title`.
pub fn extract_variant_tag(title: &str) -> Option<String> {
    RE_VARIANT_TAG
        .captures(title)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Path segment following `/products/` in a product URL.
pub fn product_path_segment(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let mut segments = parsed.path_segments()?;
    while let Some(segment) = segments.next() {
        if segment == "products" {
            return segments
                .next()
                .map(|s| s.trim_end_matches(".js").to_string())
                .filter(|s| !s.is_empty());
        }
    }
    None
}

/// Best-effort stable key for a snapshot, ignoring its variant tag.
pub fn identity_raw(snapshot: &ProductSnapshot) -> Option<String> {
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    non_empty(&snapshot.handle)
        .or_else(|| non_empty(&snapshot.product_id))
        .or_else(|| product_path_segment(&snapshot.url))
        .or_else(|| Some(snapshot.url.trim().to_string()).filter(|u| !u.is_empty()))
}

/// Resolve the tracking identity, or `None` when the snapshot carries nothing
/// usable as a key.
pub fn resolve(snapshot: &ProductSnapshot) -> Option<TrackingIdentity> {
    let raw = identity_raw(snapshot)?;
    Some(match snapshot.variant_tag.as_deref() {
        Some(tag) => TrackingIdentity::new(format!("{raw}::#{tag}")),
        None => TrackingIdentity::new(raw),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(handle: Option<&str>, id: Option<&str>, url: &str, tag: Option<&str>) -> ProductSnapshot {
        ProductSnapshot {
            handle: handle.map(str::to_string),
            product_id: id.map(str::to_string),
            url: url.to_string(),
            title: "Test card".to_string(),
            stock: 1,
            price_minor: 20_000,
            variant_tag: tag.map(str::to_string),
        }
    }

    #[test]
    fn variant_tag_requires_hash_prefix() {
        assert_eq!(extract_variant_tag("Charizard #1384 PSA10"), Some("1384".to_string()));
        assert_eq!(extract_variant_tag("Charizard 1384 PSA10"), None);
        assert_eq!(extract_variant_tag("Charizard #13"), None);
    }

    #[test]
    fn first_variant_tag_wins() {
        assert_eq!(extract_variant_tag("#1672 / #1415"), Some("1672".to_string()));
    }

    #[test]
    fn handle_takes_precedence() {
        let s = snapshot(Some("sword-x"), Some("42"), "https://shop.test/products/other", None);
        assert_eq!(resolve(&s).unwrap().as_str(), "sword-x");
    }

    #[test]
    fn falls_back_to_id_then_url_segment_then_url() {
        let by_id = snapshot(Some(""), Some("42"), "https://shop.test/products/other", None);
        assert_eq!(resolve(&by_id).unwrap().as_str(), "42");

        let by_segment = snapshot(None, None, "https://shop.test/products/from-path", None);
        assert_eq!(resolve(&by_segment).unwrap().as_str(), "from-path");

        let by_url = snapshot(None, None, "https://shop.test/collections/x", None);
        assert_eq!(resolve(&by_url).unwrap().as_str(), "https://shop.test/collections/x");
    }

    #[test]
    fn empty_sources_skip() {
        let s = snapshot(None, Some("  "), "", None);
        assert!(resolve(&s).is_none());
    }

    #[test]
    fn variant_tags_split_identities() {
        let a = snapshot(Some("sword-x"), None, "https://shop.test/products/sword-x", Some("1384"));
        let b = snapshot(Some("sword-x"), None, "https://shop.test/products/sword-x", Some("1415"));

        let id_a = resolve(&a).unwrap();
        let id_b = resolve(&b).unwrap();

        assert_eq!(id_a.as_str(), "sword-x::#1384");
        assert_eq!(id_b.as_str(), "sword-x::#1415");
        assert_ne!(id_a, id_b);
    }

    #[test]
    fn product_segment_strips_json_suffix() {
        assert_eq!(
            product_path_segment("https://shop.test/products/sword-x.js"),
            Some("sword-x".to_string())
        );
        assert_eq!(product_path_segment("https://shop.test/collections/pmcg"), None);
    }
}
