use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::traits::StateStore;
use crate::types::{EventKind, ProductState, TrackingIdentity};

/// Postgres-backed state store.
///
/// Dedup admission is a single `INSERT ... ON CONFLICT` statement, so
/// concurrent pollers racing on the same key see exactly one winner.
pub struct PostgresStateStore {
    pool: PgPool,
}

impl PostgresStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply embedded migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn corrupt(identity: &TrackingIdentity, reason: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        key: identity.to_string(),
        reason: reason.into(),
    }
}

#[async_trait]
impl StateStore for PostgresStateStore {
    async fn get_state(&self, identity: &TrackingIdentity) -> StoreResult<Option<ProductState>> {
        let row = sqlx::query(
            r#"
            SELECT last_stock, last_price_minor, last_variant_tag,
                   last_event_kind, last_event_at, first_seen_at
            FROM product_states
            WHERE identity = $1
            "#,
        )
        .bind(identity.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };

        let last_stock = r
            .get::<Option<i64>, _>("last_stock")
            .map(u32::try_from)
            .transpose()
            .map_err(|_| corrupt(identity, "last_stock out of range"))?;
        let last_price_minor = r
            .get::<Option<i64>, _>("last_price_minor")
            .map(u64::try_from)
            .transpose()
            .map_err(|_| corrupt(identity, "last_price_minor out of range"))?;
        let last_event_kind = match r.get::<Option<String>, _>("last_event_kind") {
            Some(kind) if !kind.is_empty() => Some(
                EventKind::parse(&kind)
                    .ok_or_else(|| corrupt(identity, format!("unknown event kind {kind}")))?,
            ),
            _ => None,
        };

        Ok(Some(ProductState {
            last_stock,
            last_price_minor,
            last_variant_tag: r.get("last_variant_tag"),
            last_event_kind,
            last_event_at: r.get::<Option<DateTime<Utc>>, _>("last_event_at"),
            first_seen_at: r.get("first_seen_at"),
        }))
    }

    async fn set_state(&self, identity: &TrackingIdentity, state: &ProductState) -> StoreResult<()> {
        let last_price = state
            .last_price_minor
            .map(i64::try_from)
            .transpose()
            .map_err(|_| corrupt(identity, "last_price_minor exceeds BIGINT"))?;

        sqlx::query(
            r#"
            INSERT INTO product_states (
                identity, last_stock, last_price_minor, last_variant_tag,
                last_event_kind, last_event_at, first_seen_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (identity) DO UPDATE SET
                last_stock = EXCLUDED.last_stock,
                last_price_minor = EXCLUDED.last_price_minor,
                last_variant_tag = EXCLUDED.last_variant_tag,
                last_event_kind = EXCLUDED.last_event_kind,
                last_event_at = EXCLUDED.last_event_at,
                first_seen_at = EXCLUDED.first_seen_at,
                updated_at = NOW()
            "#,
        )
        .bind(identity.as_str())
        .bind(state.last_stock.map(i64::from))
        .bind(last_price)
        .bind(&state.last_variant_tag)
        .bind(state.last_event_kind.map(|k| k.as_str()))
        .bind(state.last_event_at)
        .bind(state.first_seen_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear_state(&self, identity: &TrackingIdentity) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM product_states WHERE identity = $1")
            .bind(identity.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn admit(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        // Inserts a fresh claim, or takes over one whose expiry has passed.
        // A live claim makes the WHERE false and RETURNING yields nothing.
        let row = sqlx::query(
            r#"
            INSERT INTO dedup_claims (claim_key, expires_at)
            VALUES ($1, NOW() + make_interval(secs => $2))
            ON CONFLICT (claim_key) DO UPDATE
                SET expires_at = EXCLUDED.expires_at
                WHERE dedup_claims.expires_at <= NOW()
            RETURNING claim_key
            "#,
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn page_hash(&self, page_url: &str) -> StoreResult<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT content_hash
            FROM page_hashes
            WHERE page_url = $1 AND expires_at > NOW()
            "#,
        )
        .bind(page_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("content_hash")))
    }

    async fn set_page_hash(&self, page_url: &str, hash: &str, ttl: Duration) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO page_hashes (page_url, content_hash, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3))
            ON CONFLICT (page_url) DO UPDATE SET
                content_hash = EXCLUDED.content_hash,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(page_url)
        .bind(hash)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_expired(&self) -> StoreResult<u64> {
        let claims = sqlx::query("DELETE FROM dedup_claims WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        let hashes = sqlx::query("DELETE FROM page_hashes WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(claims.rows_affected() + hashes.rows_affected())
    }
}
