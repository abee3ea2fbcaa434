//! CVE feed ingestion CLI

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

use cvefeed_common::logging::{init_logging, LogConfig};
use cvefeed_ingest::{
    ElasticIndex, FeedFetcher, InMemoryCache, IngestPipeline, PgRecordStore, PipelineConfig,
    RetryPolicy, TaskRunner, TriggerSource,
};

#[derive(Parser)]
#[command(name = "cvefeed-ingest")]
#[command(about = "Ingest the NVD vulnerability feed into Postgres and Elasticsearch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full ingestion pipeline once
    Run {
        /// Mark the run as scheduler-triggered instead of manual
        #[arg(long)]
        scheduled: bool,
    },
    /// Download and stage the feed without loading it
    FetchOnly {
        /// Keep the staging artifact instead of removing it
        #[arg(long)]
        keep: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_config = LogConfig::from_env().context("Failed to load log configuration")?;
    init_logging(&log_config).context("Failed to initialize logging")?;

    let cli = Cli::parse();
    let config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;

    match cli.command {
        Commands::Run { scheduled } => run_pipeline(config, scheduled).await,
        Commands::FetchOnly { keep } => fetch_only(config, keep).await,
    }
}

async fn run_pipeline(config: PipelineConfig, scheduled: bool) -> anyhow::Result<()> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set for `run`")?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("Failed to connect to Postgres")?;

    let store = PgRecordStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("Failed to prepare the cve_items table")?;

    let index = ElasticIndex::new(config.search.clone()).context("Failed to build search client")?;
    let policy = RetryPolicy::from_config(&config);
    let pipeline = IngestPipeline::new(
        config,
        Arc::new(store),
        Arc::new(index),
        Arc::new(InMemoryCache::new()),
    )?;

    let trigger = if scheduled {
        TriggerSource::Scheduled
    } else {
        TriggerSource::Manual
    };

    let runner = TaskRunner::new(policy);
    let (run_id, outcome) = runner.execute(&pipeline, trigger).await;
    let metrics = outcome.with_context(|| format!("Ingestion run {} failed", run_id))?;

    info!(
        run_id = %run_id,
        records = metrics.load.records_loaded,
        windows = metrics.load.windows_committed,
        skipped = metrics.parse.parse_errors,
        indexed = metrics.load.indexed,
        index_failures = metrics.load.index_failures,
        "Ingestion finished"
    );
    Ok(())
}

async fn fetch_only(config: PipelineConfig, keep: bool) -> anyhow::Result<()> {
    let fetcher = FeedFetcher::new(config)?;
    let (artifact, metrics) = fetcher.fetch().await.context("Feed download failed")?;

    info!(
        path = %artifact.path.display(),
        bytes_downloaded = metrics.bytes_downloaded,
        artifact_bytes = metrics.artifact_bytes,
        duration_secs = metrics.duration_secs,
        "Feed staged"
    );

    if keep {
        println!("{}", artifact.path.display());
    } else {
        artifact.remove().await.context("Failed to remove artifact")?;
    }
    Ok(())
}
