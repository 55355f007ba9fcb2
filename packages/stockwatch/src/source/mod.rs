//! Snapshot sources.

pub mod http;
pub mod product;

use url::Url;

pub use http::HttpSnapshotSource;
pub use product::ShopifyProduct;

/// Collection page URL: `base` with its `page` query parameter set to `page`.
///
/// Other query parameters on `base` are kept in order.
pub fn page_url(base: &Url, page: u32) -> Url {
    let retained: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(k, _)| *k != "page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    let mut url = base.clone();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("page", &page.to_string());
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_url_sets_page_param() {
        let base = Url::parse("https://shop.test/collections/pmcg").unwrap();
        assert_eq!(
            page_url(&base, 2).as_str(),
            "https://shop.test/collections/pmcg?page=2"
        );
    }

    #[test]
    fn page_url_replaces_existing_page_and_keeps_other_params() {
        let base = Url::parse("https://shop.test/collections/pmcg?sort_by=price&page=9").unwrap();
        assert_eq!(
            page_url(&base, 3).as_str(),
            "https://shop.test/collections/pmcg?sort_by=price&page=3"
        );
    }
}
