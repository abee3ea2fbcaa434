//! Pipeline orchestration
//!
//! Wires fetcher, parser, loader, search index and cache into one run:
//! FETCH -> LOAD -> INDEX_SETUP -> DONE. The staging artifact is removed
//! on every exit path, success or failure, so retries always start from
//! a fresh download.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::ResultCache;
use crate::config::PipelineConfig;
use crate::fetcher::FeedFetcher;
use crate::loader::{BatchLoader, LoadMetrics};
use crate::models::FeedArtifact;
use crate::parser::{FeedParser, ParseStats};
use crate::run::{RunMetrics, RunStage};
use crate::search::SearchIndex;
use crate::store::RecordStore;
use crate::task::ProgressHandle;
use crate::Result;

/// One fully wired ingestion pipeline
pub struct IngestPipeline {
    config: PipelineConfig,
    fetcher: FeedFetcher,
    store: Arc<dyn RecordStore>,
    index: Arc<dyn SearchIndex>,
    cache: Arc<dyn ResultCache>,
    cancel: Arc<AtomicBool>,
}

impl IngestPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn RecordStore>,
        index: Arc<dyn SearchIndex>,
        cache: Arc<dyn ResultCache>,
    ) -> Result<Self> {
        let fetcher = FeedFetcher::new(config.clone())?;
        Ok(Self {
            config,
            fetcher,
            store,
            index,
            cache,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Share a cancellation flag; observed at load window boundaries.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Execute one attempt of the pipeline, reporting through `progress`.
    ///
    /// Errors bubble up unclassified; the task substrate decides whether
    /// the attempt is retried.
    pub async fn execute(&self, progress: &ProgressHandle) -> Result<RunMetrics> {
        info!(run_id = %progress.id(), url = %self.config.feed_url, "Step 1/4: Downloading feed");
        progress.enter_stage(RunStage::Fetch, "Downloading feed");
        let (artifact, fetch) = self.fetcher.fetch().await?;

        let staged = self.load_and_finalize(&artifact, progress).await;
        if let Err(e) = artifact.remove().await {
            warn!(error = %e, path = %artifact.path.display(), "Failed to remove staging artifact");
        }
        let (parse, load) = staged?;

        let metrics = RunMetrics { fetch, parse, load };
        progress.set_metrics(metrics.clone());
        progress.enter_stage(RunStage::Done, "Ingestion complete");
        info!(
            run_id = %progress.id(),
            records = metrics.load.records_loaded,
            windows = metrics.load.windows_committed,
            skipped = metrics.parse.parse_errors,
            index_failures = metrics.load.index_failures,
            "Ingestion run complete"
        );
        Ok(metrics)
    }

    async fn load_and_finalize(
        &self,
        artifact: &FeedArtifact,
        progress: &ProgressHandle,
    ) -> Result<(ParseStats, LoadMetrics)> {
        info!(run_id = %progress.id(), "Step 2/4: Loading records");
        progress.enter_stage(RunStage::Load, "Loading records");

        let mut stream = FeedParser::open(artifact)?;
        let loader = BatchLoader::new(
            self.store.clone(),
            self.index.clone(),
            self.config.batch_size,
        )
        .with_cancel_flag(self.cancel.clone());

        let load = loader
            .load(&mut stream, |m| {
                progress.record_window(m.windows_committed, m.records_loaded)
            })
            .await?;
        let parse = stream.stats();

        info!(run_id = %progress.id(), "Step 3/4: Preparing search index");
        progress.enter_stage(RunStage::IndexSetup, "Preparing search index");
        // Index setup is best effort, like indexing itself: the store is
        // the source of truth and a run never fails here.
        if let Err(e) = self.index.ensure_index().await {
            warn!(error = %e, "Search index setup failed");
        }

        info!(run_id = %progress.id(), "Step 4/4: Invalidating query caches");
        let removed = self.cache.invalidate_all().await;
        debug!(removed, "Query cache invalidated");

        Ok((parse, load))
    }
}

// ============================================================================
// Tests
// ============================================================================
