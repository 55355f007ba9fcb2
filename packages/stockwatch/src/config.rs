use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use serde_json::Value;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;
use url::Url;

use crate::error::ConfigError;
use crate::notify::EmailOptions;
use crate::pipeline::PipelineSettings;
use crate::scheduler::{PollSettings, DEFAULT_PAGES};
use crate::types::{ChannelConfig, DetectorFlags, DispatchPolicy, PageSet, Priority};

/// Name given to the channel built from `TARGET_COLLECTION_BASE`.
pub const LEGACY_CHANNEL_NAME: &str = "default";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres state store; in-memory when unset
    pub database_url: Option<String>,
    pub slack_webhook_url: Option<String>,
    /// Present when `EMAIL_ENABLED=true`
    pub email: Option<EmailOptions>,
    pub pipeline: PipelineSettings,
    pub poll: PollSettings,
    pub channels: Vec<ChannelConfig>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from any name -> value lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let email = if flag(&var, "EMAIL_ENABLED")? {
            Some(EmailOptions {
                server_token: var("POSTMARK_SERVER_TOKEN")
                    .context("POSTMARK_SERVER_TOKEN must be set when EMAIL_ENABLED=true")?,
                from: var("EMAIL_FROM").context("EMAIL_FROM must be set when EMAIL_ENABLED=true")?,
                to: var("EMAIL_TO")
                    .map(|v| split_list(&v))
                    .filter(|to| !to.is_empty())
                    .context("EMAIL_TO must be set when EMAIL_ENABLED=true")?,
            })
        } else {
            None
        };

        let pipeline = PipelineSettings {
            price_threshold: num(&var, "PRICE_THRESHOLD_YEN", 10_000)?,
            dedup_cooldown: secs(&var, "DEDUPE_COOLDOWN_SEC", 180)?,
            flags: DetectorFlags {
                notify_on_stock_decrease: flag(&var, "NOTIFY_STOCK_DECREASE")?,
                notify_on_sold_out: flag(&var, "NOTIFY_SOLD_OUT")?,
            },
            policy: DispatchPolicy {
                notify_on_price_change: flag(&var, "NOTIFY_PRICE_CHANGE")?,
            },
        };

        let poll = PollSettings {
            hot_interval: secs(&var, "HOT_INTERVAL_SEC", 20)?,
            normal_interval: secs(&var, "WARM_INTERVAL_SEC", 60)?,
            cold_interval: secs(&var, "COLD_INTERVAL_SEC", 300)?,
            rps_budget: num(&var, "RPS_BUDGET", 0.8)?,
            jitter_min_ms: num(&var, "JITTER_MS_MIN", 200)?,
            jitter_max_ms: num(&var, "JITTER_MS_MAX", 1200)?,
            page_hash_ttl: secs(&var, "PAGE_HASH_TTL_SEC", 3600)?,
            hot_pages: num(&var, "HOT_PAGES", 3)?,
            concurrency: num(&var, "WORKER_CONCURRENCY", 4usize)?.max(1),
            product_timeout: secs(&var, "PRODUCT_TIMEOUT_SEC", 45)?,
            purge_interval: secs(&var, "PURGE_INTERVAL_SEC", 600)?,
        };

        let channels = parse_collections(
            var("COLLECTIONS").as_deref(),
            var("TARGET_COLLECTION_BASE").as_deref(),
            var("PAGES").as_deref(),
        )
        .context("Failed to build collection list")?;

        Ok(Self {
            database_url: var("DATABASE_URL"),
            slack_webhook_url: var("SLACK_WEBHOOK_URL"),
            email,
            pipeline,
            poll,
            channels,
        })
    }
}

fn num<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
    }
}

fn secs(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: u64,
) -> Result<Duration, ConfigError> {
    num(var, name, default).map(Duration::from_secs)
}

fn flag(var: &impl Fn(&str) -> Option<String>, name: &'static str) -> Result<bool, ConfigError> {
    match var(name) {
        None => Ok(false),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { name, value: raw }),
        },
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Deserialize)]
struct CollectionEntry {
    name: Option<String>,
    base: Option<String>,
    url: Option<String>,
    #[serde(default)]
    pages: Option<Value>,
    priority: Option<String>,
}

/// Build the channel list.
///
/// `COLLECTIONS` (a JSON array) wins when it parses to a non-empty list;
/// otherwise the legacy `TARGET_COLLECTION_BASE` + `PAGES` pair is used.
pub fn parse_collections(
    collections_json: Option<&str>,
    legacy_base: Option<&str>,
    legacy_pages: Option<&str>,
) -> Result<Vec<ChannelConfig>, ConfigError> {
    if let Some(json) = collections_json {
        match serde_json::from_str::<Vec<CollectionEntry>>(json) {
            Ok(entries) if !entries.is_empty() => {
                return entries.into_iter().map(channel_from_entry).collect();
            }
            Ok(_) => warn!("COLLECTIONS is empty, using legacy config"),
            Err(e) => warn!(error = %e, "COLLECTIONS JSON parse failed, using legacy config"),
        }
    }

    let base = legacy_base.ok_or(ConfigError::NoChannels)?;
    Ok(vec![ChannelConfig {
        name: LEGACY_CHANNEL_NAME.to_string(),
        base: parse_base(LEGACY_CHANNEL_NAME, base)?,
        pages: parse_legacy_pages(legacy_pages),
        priority: Priority::Hot,
    }])
}

fn channel_from_entry(entry: CollectionEntry) -> Result<ChannelConfig, ConfigError> {
    let name = entry
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let raw_base = entry
        .base
        .or(entry.url)
        .ok_or_else(|| ConfigError::InvalidChannelUrl {
            channel: name.clone(),
            url: String::new(),
        })?;

    Ok(ChannelConfig {
        base: parse_base(&name, &raw_base)?,
        pages: parse_pages_value(entry.pages.as_ref()),
        priority: entry
            .priority
            .as_deref()
            .map(Priority::from_label)
            .unwrap_or(Priority::Normal),
        name,
    })
}

fn parse_base(channel: &str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw.trim())
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .ok_or_else(|| ConfigError::InvalidChannelUrl {
            channel: channel.to_string(),
            url: raw.to_string(),
        })
}

fn page_number(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|n| *n >= 1)
}

fn default_pages() -> PageSet {
    PageSet::Explicit(DEFAULT_PAGES.to_vec())
}

/// Canonical page set from a `COLLECTIONS` entry's `pages` field.
///
/// Accepts an array, `"all"` / `"*"`, a `"start-end"` range, or a single
/// number. Missing or unusable values mean the default pages.
pub fn parse_pages_value(value: Option<&Value>) -> PageSet {
    let Some(value) = value else {
        return default_pages();
    };

    let pages: Vec<u32> = match value {
        Value::Null => return default_pages(),
        Value::String(s) if matches!(s.trim(), "all" | "*") => return PageSet::AutoDetect,
        Value::Array(items) => items.iter().filter_map(page_number).collect(),
        Value::String(s) if s.contains('-') => parse_range(s),
        other => page_number(other).into_iter().collect(),
    };

    if pages.is_empty() {
        warn!(pages = %value, "Unusable pages value, using default pages");
        return default_pages();
    }
    PageSet::Explicit(pages)
}

fn parse_range(raw: &str) -> Vec<u32> {
    let Some((start, end)) = raw.split_once('-') else {
        return Vec::new();
    };
    match (start.trim().parse::<u32>(), end.trim().parse::<u32>()) {
        (Ok(start), Ok(end)) if start <= end => (start.max(1)..=end).collect(),
        _ => Vec::new(),
    }
}

/// Canonical page set from the legacy comma-separated `PAGES` value.
pub fn parse_legacy_pages(raw: Option<&str>) -> PageSet {
    let Some(raw) = raw.map(str::trim) else {
        return default_pages();
    };
    if matches!(raw, "all" | "*") {
        return PageSet::AutoDetect;
    }

    let pages: Vec<u32> = raw
        .split(',')
        .filter_map(|p| p.trim().parse().ok())
        .filter(|p| *p >= 1)
        .collect();

    if pages.is_empty() {
        default_pages()
    } else {
        PageSet::Explicit(pages)
    }
}
