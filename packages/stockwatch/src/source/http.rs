//! HTTP snapshot source for Shopify-style storefronts.
//!
//! Collection pages are fetched as HTML and scanned for `/products/<handle>`
//! links; each product is then read from its `/products/<handle>.js` JSON.

use async_trait::async_trait;
use indexmap::IndexSet;
use regex::Regex;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use super::page_url;
use super::product::ShopifyProduct;
use crate::error::{SourceError, SourceResult};
use crate::identity::product_path_segment;
use crate::traits::SnapshotSource;
use crate::types::{ChannelPage, ProductSnapshot};

const USER_AGENT: &str = concat!("stockwatch/", env!("CARGO_PKG_VERSION"));

static RE_PAGE_NUMBER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(\d{1,3})\b").unwrap());

pub struct HttpSnapshotSource {
    client: reqwest::Client,
}

impl HttpSnapshotSource {
    pub fn new() -> SourceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(Self { client })
    }

    /// GET `url`; `Ok(None)` on 404.
    async fn get_text(&self, url: &Url) -> SourceResult<Option<String>> {
        let response = self.client.get(url.clone()).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        Ok(Some(response.text().await?))
    }

    async fn get_required(&self, url: &Url) -> SourceResult<String> {
        self.get_text(url).await?.ok_or_else(|| SourceError::Status {
            url: url.to_string(),
            status: 404,
        })
    }
}

/// Hex SHA-256 of a page body.
pub fn content_hash(body: &str) -> String {
    hex::encode(Sha256::digest(body.as_bytes()))
}

/// Canonical product URLs linked from a collection page, in page order.
///
/// Only same-host `/products/...` links count; query and fragment are dropped.
pub fn extract_product_urls(html: &str, base: &Url) -> Vec<Url> {
    let document = Html::parse_document(html);
    let selector = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return vec![],
    };

    let links: IndexSet<Url> = document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .filter(|url| url.host_str() == base.host_str() && url.path().starts_with("/products/"))
        .map(|mut url| {
            url.set_query(None);
            url.set_fragment(None);
            url
        })
        .collect();

    links.into_iter().collect()
}

/// Highest page number advertised by a collection page's pagination.
///
/// Reads `page=` links and bare numbers (below 1000) inside pagination
/// containers. Returns `None` unless more than one page is advertised.
pub fn parse_max_page(html: &str, base: &Url) -> Option<u32> {
    let document = Html::parse_document(html);
    let mut max_page = 1u32;

    if let Ok(selector) = Selector::parse(r#"a[href*="page="]"#) {
        for href in document.select(&selector).filter_map(|el| el.value().attr("href")) {
            let Ok(url) = base.join(href) else { continue };
            let page = url
                .query_pairs()
                .find(|(k, _)| *k == "page")
                .and_then(|(_, v)| v.parse::<u32>().ok());
            if let Some(page) = page {
                max_page = max_page.max(page);
            }
        }
    }

    if let Ok(selector) = Selector::parse(r#".pagination, .pager, [class*="page"]"#) {
        let text: String = document
            .select(&selector)
            .flat_map(|el| el.text())
            .collect::<Vec<_>>()
            .join(" ");
        for cap in RE_PAGE_NUMBER.captures_iter(&text) {
            if let Ok(n) = cap[1].parse::<u32>() {
                if n < 1000 {
                    max_page = max_page.max(n);
                }
            }
        }
    }

    (max_page > 1).then_some(max_page)
}

/// `{origin}/products/{handle}.js` for a product page URL.
pub fn product_json_url(product_url: &Url) -> Option<Url> {
    let handle = product_path_segment(product_url.as_str())?;
    product_url
        .join(&format!("/products/{handle}.js"))
        .ok()
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn fetch_channel_page(&self, base: &Url, page: u32) -> SourceResult<ChannelPage> {
        let url = page_url(base, page);
        let html = self.get_required(&url).await?;

        let content_hash = content_hash(&html);
        let product_urls = extract_product_urls(&html, base);

        debug!(url = %url, products = product_urls.len(), "Fetched collection page");

        Ok(ChannelPage {
            url,
            content_hash,
            product_urls,
        })
    }

    async fn fetch_product_snapshot(&self, url: &Url) -> SourceResult<Option<ProductSnapshot>> {
        let Some(json_url) = product_json_url(url) else {
            warn!(url = %url, "No product handle in URL");
            return Ok(None);
        };

        let Some(body) = self.get_text(&json_url).await? else {
            debug!(url = %json_url, "Product not found");
            return Ok(None);
        };

        match ShopifyProduct::parse(&body) {
            Ok(product) => Ok(Some(product.into_snapshot(url.as_str()))),
            Err(e) => {
                warn!(url = %json_url, error = %e, "Unparseable product JSON");
                Ok(None)
            }
        }
    }

    async fn detect_max_page(&self, base: &Url) -> SourceResult<Option<u32>> {
        let url = page_url(base, 1);
        let html = self.get_required(&url).await?;
        Ok(parse_max_page(&html, base))
    }
}
