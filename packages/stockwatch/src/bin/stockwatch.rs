// Main entry point for the stock watcher

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockwatch::{
    BatcherHandle, Config, FanoutSink, HttpSnapshotSource, MemoryStateStore, NotificationSink,
    PageSet, PassSummary, PollScheduler, PostgresStateStore, PostmarkEmailSink, ProductPipeline,
    SlackWebhookSink, SnapshotSource, StateStore, TrackingIdentity,
};

#[derive(Parser)]
#[command(name = "stockwatch")]
#[command(about = "Watch storefront collections for restocks of high-value products")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll configured collections until interrupted
    Watch,

    /// Poll every collection once, print a summary and exit
    Oneshot,

    /// List configured collections
    Channels {
        /// Probe auto-detected collections for their page count
        #[arg(long)]
        resolve: bool,
    },

    /// Forget the stored state of one tracked product
    ClearState {
        /// Tracking identity, e.g. `charizard-ex` or `charizard-ex::#1384`
        identity: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,stockwatch=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(channels = config.channels.len(), "Configuration loaded");

    match cli.command {
        Commands::Watch => watch(config, false).await,
        Commands::Oneshot => watch(config, true).await,
        Commands::Channels { resolve } => list_channels(config, resolve).await,
        Commands::ClearState { identity } => clear_state(config, identity).await,
    }
}

async fn open_store(config: &Config) -> Result<Arc<dyn StateStore>> {
    let Some(database_url) = &config.database_url else {
        tracing::warn!("DATABASE_URL not set, using in-memory state (lost on restart)");
        return Ok(Arc::new(MemoryStateStore::new()));
    };

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    let store = PostgresStateStore::new(pool);
    store.migrate().await.context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    match store.purge_expired().await {
        Ok(removed) => tracing::debug!(removed, "Expired claims and page hashes purged"),
        Err(e) => tracing::warn!(error = %e, "Failed to purge expired rows"),
    }

    Ok(Arc::new(store))
}

fn build_sink(config: &Config) -> Result<Arc<dyn NotificationSink>> {
    let mut sinks: Vec<Arc<dyn NotificationSink>> = Vec::new();

    if config.slack_webhook_url.is_none() {
        tracing::warn!("SLACK_WEBHOOK_URL not set, chat messages go to the log");
    }
    sinks.push(Arc::new(
        SlackWebhookSink::new(config.slack_webhook_url.clone())
            .context("Failed to create chat webhook client")?,
    ));

    if let Some(email) = &config.email {
        sinks.push(Arc::new(
            PostmarkEmailSink::new(email.clone()).context("Failed to create email client")?,
        ));
        tracing::info!(recipients = email.to.len(), "Email notifications enabled");
    }

    Ok(Arc::new(FanoutSink::new(sinks)))
}

async fn watch(config: Config, once: bool) -> Result<()> {
    let store = open_store(&config).await?;
    let source: Arc<dyn SnapshotSource> =
        Arc::new(HttpSnapshotSource::new().context("Failed to create HTTP client")?);
    let (batcher, batcher_task) = BatcherHandle::spawn(build_sink(&config)?);

    let pipeline = Arc::new(ProductPipeline::new(
        store.clone(),
        batcher.clone(),
        config.pipeline,
    ));
    let mut scheduler = PollScheduler::new(source, store, pipeline, batcher, config.poll);
    scheduler.resolve_channels(config.channels).await;

    if once {
        let summaries = scheduler.run_once().await;
        print_summaries(&summaries);
    } else {
        tokio::select! {
            _ = scheduler.run() => {}
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for shutdown signal")?;
                tracing::info!("Shutting down");
            }
        }
    }

    // Dropping the last handle stops the batcher once its queue is drained.
    drop(scheduler);
    batcher_task.await.context("Batcher task failed")?;
    Ok(())
}

fn print_summaries(summaries: &[PassSummary]) {
    println!(
        "{:<16} {:>6} {:>8} {:>9} {:>7} {:>7} {:>5}",
        "CHANNEL", "PAGES", "SKIPPED", "PRODUCTS", "ERRORS", "EVENTS", "SENT"
    );
    for s in summaries {
        println!(
            "{:<16} {:>6} {:>8} {:>9} {:>7} {:>7} {:>5}",
            s.channel,
            s.pages_processed,
            s.pages_skipped,
            s.products,
            s.page_errors + s.product_errors,
            s.events,
            s.flush.items,
        );
    }
}

async fn list_channels(config: Config, resolve: bool) -> Result<()> {
    for channel in &config.channels {
        let pages = match &channel.pages {
            PageSet::Explicit(pages) => format!("{pages:?}"),
            PageSet::AutoDetect if resolve => {
                let source = HttpSnapshotSource::new().context("Failed to create HTTP client")?;
                let pages = stockwatch::scheduler::resolve_pages(&source, channel).await;
                format!("auto -> {pages:?}")
            }
            PageSet::AutoDetect => "auto".to_string(),
        };

        println!(
            "{} [{}, every {}s] {} pages={}",
            channel.name,
            channel.priority.as_str(),
            config.poll.interval_for(channel.priority).as_secs(),
            channel.base,
            pages,
        );
    }
    Ok(())
}

async fn clear_state(config: Config, identity: String) -> Result<()> {
    let store = open_store(&config).await?;
    let identity = TrackingIdentity::new(identity);

    let existed = store
        .clear_state(&identity)
        .await
        .context("Failed to clear state")?;

    if existed {
        println!("Cleared state for {identity}");
    } else {
        println!("No state stored for {identity}");
    }
    Ok(())
}
