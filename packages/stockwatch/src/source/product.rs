//! Shopify product JSON (`/products/<handle>.js`) and its mapping to a snapshot.

use serde::Deserialize;
use serde_json::Value;

use crate::error::SourceResult;
use crate::identity::extract_variant_tag;
use crate::types::ProductSnapshot;

/// The subset of the storefront product JSON the watcher reads.
#[derive(Debug, Clone, Deserialize)]
pub struct ShopifyProduct {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub handle: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub variants: Vec<ShopifyVariant>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShopifyVariant {
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub inventory_quantity: Option<Value>,
    /// Minor units (cents), as a number or a numeric string
    #[serde(default)]
    pub price: Option<Value>,
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

impl ShopifyVariant {
    /// Units purchasable from this variant.
    ///
    /// An available variant with unknown or non-positive quantity counts as 1.
    pub fn stock(&self) -> u64 {
        let quantity = self
            .inventory_quantity
            .as_ref()
            .and_then(as_number)
            .filter(|q| *q > 0.0)
            .map(|q| q as u64);

        match (self.available, quantity) {
            (_, Some(q)) => q,
            (true, None) => 1,
            (false, None) => 0,
        }
    }

    /// Price in yen, rounded from minor units.
    pub fn price_yen(&self) -> u64 {
        self.price
            .as_ref()
            .and_then(as_number)
            .filter(|p| *p > 0.0)
            .map(|p| (p / 100.0).round() as u64)
            .unwrap_or(0)
    }
}

impl ShopifyProduct {
    pub fn parse(body: &str) -> SourceResult<Self> {
        Ok(serde_json::from_str(body)?)
    }

    fn id_string(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }

    /// Snapshot of this product as observed at `url`.
    ///
    /// Stock is summed across variants; price is the most expensive variant.
    pub fn into_snapshot(self, url: &str) -> ProductSnapshot {
        let stock: u64 = self.variants.iter().map(ShopifyVariant::stock).sum();
        let price_minor = self
            .variants
            .iter()
            .map(ShopifyVariant::price_yen)
            .max()
            .unwrap_or(0);

        ProductSnapshot {
            product_id: self.id_string(),
            variant_tag: extract_variant_tag(&self.title),
            handle: self.handle.filter(|h| !h.is_empty()),
            url: url.to_string(),
            title: self.title,
            stock: u32::try_from(stock).unwrap_or(u32::MAX),
            price_minor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCT_JSON: &str = r##"{
        "id": 8123456789,
        "handle": "charizard-ex-sar-1384",
        "title": "Charizard ex SAR #1384 [PSA10]",
        "variants": [
            {"id": 1, "available": true, "inventory_quantity": 2, "price": 1500000},
            {"id": 2, "available": false, "inventory_quantity": 0, "price": "1800000"}
        ]
    }"##;

    #[test]
    fn maps_product_json_to_snapshot() {
        let snapshot = ShopifyProduct::parse(PRODUCT_JSON)
            .unwrap()
            .into_snapshot("https://shop.test/products/charizard-ex-sar-1384");

        assert_eq!(snapshot.product_id.as_deref(), Some("8123456789"));
        assert_eq!(snapshot.handle.as_deref(), Some("charizard-ex-sar-1384"));
        assert_eq!(snapshot.stock, 2);
        assert_eq!(snapshot.price_minor, 18_000);
        assert_eq!(snapshot.variant_tag.as_deref(), Some("1384"));
    }

    #[test]
    fn available_without_quantity_counts_as_one() {
        let variant: ShopifyVariant =
            serde_json::from_str(r#"{"available": true, "price": 1000000}"#).unwrap();
        assert_eq!(variant.stock(), 1);
        assert_eq!(variant.price_yen(), 10_000);

        let variant: ShopifyVariant =
            serde_json::from_str(r#"{"available": true, "inventory_quantity": -3}"#).unwrap();
        assert_eq!(variant.stock(), 1);
    }

    #[test]
    fn unavailable_negative_quantity_is_zero() {
        let variant: ShopifyVariant =
            serde_json::from_str(r#"{"available": false, "inventory_quantity": -1}"#).unwrap();
        assert_eq!(variant.stock(), 0);
    }

    #[test]
    fn price_rounds_minor_units() {
        let variant: ShopifyVariant = serde_json::from_str(r#"{"price": "1234550"}"#).unwrap();
        assert_eq!(variant.price_yen(), 12_346);
    }

    #[test]
    fn no_variants_means_empty_snapshot() {
        let snapshot = ShopifyProduct::parse(r#"{"handle": "x", "title": "Box"}"#)
            .unwrap()
            .into_snapshot("https://shop.test/products/x");
        assert_eq!(snapshot.stock, 0);
        assert_eq!(snapshot.price_minor, 0);
        assert!(snapshot.product_id.is_none());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(ShopifyProduct::parse("<html>").is_err());
    }
}
