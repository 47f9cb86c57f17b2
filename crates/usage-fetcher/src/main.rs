//! usage-fetcher daemon
//!
//! Runs the configured fetchers and publishes aggregated usage to NATS.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::Instant;
use prometheus::Encoder;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use usage_accountant::{LogProducer, NatsProducer, Producer, UsageAccountant};
use usage_fetcher::{DaemonConfig, FetchScheduler, FetcherRegistry};

#[derive(Debug, Parser)]
#[command(name = "usage-fetcher", version, about = "Shared resource usage fetcher")]
struct Cli {
    /// Path to the configuration file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Log usage records instead of publishing them
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("Starting usage-fetcher v{}", usage_common::VERSION);

    let config = DaemonConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    info!(
        fetchers = config.fetchers.len(),
        topic = %config.bus.topic,
        dry_run = cli.dry_run,
        "Configuration loaded"
    );

    let registry = FetcherRegistry::with_builtins();
    let fetchers = registry
        .resolve(&config.fetchers)
        .context("Failed to resolve fetchers")?;

    let producer: Arc<dyn Producer> = if cli.dry_run {
        Arc::new(LogProducer)
    } else {
        Arc::new(NatsProducer::connect(&config.bus.url).await?)
    };

    let accountant = Arc::new(UsageAccountant::new(config.accountant_config()?, producer)?);
    let scheduler = FetchScheduler::new(accountant.clone())?;

    let metrics = prometheus::Registry::new();
    accountant.metrics().register(&metrics)?;
    scheduler.metrics().register(&metrics)?;

    accountant.start();
    scheduler.start_all(fetchers);
    info!("usage-fetcher started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    let grace = config.shutdown_grace();
    let deadline = Instant::now() + grace;
    scheduler.shutdown(grace).await;
    let lost = accountant
        .shutdown(deadline.saturating_duration_since(Instant::now()))
        .await;
    if lost > 0 {
        warn!(lost, "Usage records abandoned at shutdown");
    }

    let mut buffer = Vec::new();
    if prometheus::TextEncoder::new()
        .encode(&metrics.gather(), &mut buffer)
        .is_ok()
    {
        debug!("Final metrics:\n{}", String::from_utf8_lossy(&buffer));
    }

    info!("usage-fetcher stopped");
    Ok(())
}
