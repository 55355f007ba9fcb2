//! Shared Postgres container for store integration tests.
//!
//! The container starts once per test binary and migrations run once. Each
//! test opens its own pool, since pools are bound to the runtime that made them.

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use stockwatch::PostgresStateStore;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct SharedPostgres {
    db_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_POSTGRES: OnceCell<SharedPostgres> = OnceCell::const_new();

impl SharedPostgres {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --ignored --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect to Postgres for migrations")?;
        PostgresStateStore::new(pool)
            .migrate()
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_POSTGRES
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared Postgres container")
            })
            .await
    }
}

/// A store on the shared database, with a pool owned by the calling test.
pub async fn postgres_store() -> PostgresStateStore {
    let shared = SharedPostgres::get().await;
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&shared.db_url)
        .await
        .expect("Failed to connect to shared Postgres");
    PostgresStateStore::new(pool)
}

/// Key unique to one test run, so tests sharing the database never collide.
pub fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", fastrand::u64(..))
}
