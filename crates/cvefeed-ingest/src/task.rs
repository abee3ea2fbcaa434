//! Task substrate
//!
//! Executes pipeline runs with whole-run retry: a transient failure
//! re-enters the state machine from FETCH after an exponential backoff,
//! up to the attempt ceiling. Committed windows from an earlier attempt
//! stay in the store; the replay upserts over them.
//!
//! Run state lives in a process-local registry so status can be queried
//! while a run is in flight.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::pipeline::IngestPipeline;
use crate::run::{PipelineRun, RunMetrics, RunStage, TriggerSource};
use crate::Result;

/// Shared, mutable view of one run's state
///
/// Cheap to clone; the pipeline writes through it and status queries
/// read from it concurrently.
#[derive(Clone)]
pub struct ProgressHandle {
    id: Uuid,
    inner: Arc<RwLock<PipelineRun>>,
}

impl ProgressHandle {
    pub fn new(run: PipelineRun) -> Self {
        Self {
            id: run.id,
            inner: Arc::new(RwLock::new(run)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn snapshot(&self) -> PipelineRun {
        self.read().clone()
    }

    pub fn enter_stage(&self, stage: RunStage, message: impl Into<String>) {
        self.write().enter_stage(stage, message);
    }

    pub fn record_window(&self, windows_committed: u64, records_written: u64) {
        self.write().record_window(windows_committed, records_written);
    }

    pub fn set_metrics(&self, metrics: RunMetrics) {
        self.write().metrics = metrics;
    }

    pub fn begin_attempt(&self) {
        self.write().begin_attempt();
    }

    pub fn fail(&self, error: impl std::fmt::Display) {
        self.write().fail(error);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PipelineRun> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PipelineRun> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Retry parameters for whole-run re-execution
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff_base: config.backoff_base(),
        }
    }

    /// Delay before the attempt after `failed_attempt` (1-based):
    /// base, 2x base, 4x base, ...
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed_attempt.saturating_sub(1));
        self.backoff_base.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_secs(crate::DEFAULT_BACKOFF_BASE_SECS),
        }
    }
}

/// Executes and tracks pipeline runs
#[derive(Clone, Default)]
pub struct TaskRunner {
    policy: RetryPolicy,
    runs: Arc<RwLock<HashMap<Uuid, ProgressHandle>>>,
}

impl TaskRunner {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            runs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Look up the current state of a run by id.
    pub fn status(&self, id: Uuid) -> Option<PipelineRun> {
        self.runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|h| h.snapshot())
    }

    /// All runs the registry knows about, newest first.
    pub fn runs(&self) -> Vec<PipelineRun> {
        let mut all: Vec<PipelineRun> = self
            .runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|h| h.snapshot())
            .collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all
    }

    /// Run the pipeline to a terminal state, retrying transient failures.
    ///
    /// Returns the run id alongside the outcome; the run stays queryable
    /// through [`status`](Self::status) afterwards.
    pub async fn execute(
        &self,
        pipeline: &IngestPipeline,
        trigger: TriggerSource,
    ) -> (Uuid, Result<RunMetrics>) {
        let handle = ProgressHandle::new(PipelineRun::new(trigger));
        let id = handle.id();
        self.runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handle.clone());

        let outcome = self.drive(pipeline, &handle).await;
        (id, outcome)
    }

    /// Start a run in the background and return its id immediately.
    pub fn submit(&self, pipeline: Arc<IngestPipeline>, trigger: TriggerSource) -> Uuid {
        let handle = ProgressHandle::new(PipelineRun::new(trigger));
        let id = handle.id();
        self.runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, handle.clone());

        let runner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.drive(&pipeline, &handle).await {
                error!(run_id = %id, error = %e, "Background ingestion run failed");
            }
        });
        id
    }

    async fn drive(&self, pipeline: &IngestPipeline, handle: &ProgressHandle) -> Result<RunMetrics> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            handle.begin_attempt();
            info!(run_id = %handle.id(), attempt, max_attempts = self.policy.max_attempts, "Starting ingestion attempt");

            match pipeline.execute(handle).await {
                Ok(metrics) => return Ok(metrics),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        run_id = %handle.id(),
                        attempt,
                        error = %e,
                        delay_secs = delay.as_secs(),
                        "Attempt failed with a transient error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(run_id = %handle.id(), attempt, error = %e, "Ingestion run failed");
                    handle.fail(&e);
                    return Err(e);
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use crate::testing::{feed_json, MemoryIndex, MemoryStore};
    use crate::IngestError;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn zero_backoff() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::ZERO,
        }
    }

    fn pipeline_for(url: &str, dir: &std::path::Path, store: Arc<MemoryStore>) -> IngestPipeline {
        let config = PipelineConfig::test_config(url, dir);
        IngestPipeline::new(
            config,
            store,
            Arc::new(MemoryIndex::default()),
            Arc::new(InMemoryCache::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(60));
        assert_eq!(policy.delay_after(2), Duration::from_secs(120));
        assert_eq!(policy.delay_after(3), Duration::from_secs(240));
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let server = MockServer::start().await;
        // Two failures, then a good feed
        Mock::given(method("GET"))
            .and(path("/feed.json"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed_json(&["CVE-2024-0001"])))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let pipeline = pipeline_for(&format!("{}/feed.json", server.uri()), dir.path(), store.clone());
        let runner = TaskRunner::new(zero_backoff());

        let (id, outcome) = runner.execute(&pipeline, TriggerSource::Scheduled).await;
        let metrics = outcome.unwrap();
        assert_eq!(metrics.load.records_loaded, 1);
        assert_eq!(store.len(), 1);

        let run = runner.status(id).unwrap();
        assert_eq!(run.stage, RunStage::Done);
        assert_eq!(run.attempts, 3);
    }

    #[tokio::test]
    async fn test_attempt_ceiling_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.json"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let pipeline = pipeline_for(&format!("{}/feed.json", server.uri()), dir.path(), store.clone());
        let runner = TaskRunner::new(zero_backoff());

        let (id, outcome) = runner.execute(&pipeline, TriggerSource::Manual).await;
        assert!(matches!(outcome, Err(IngestError::Transport(_))));
        assert!(store.is_empty());

        let run = runner.status(id).unwrap();
        assert_eq!(run.stage, RunStage::Failed);
        assert_eq!(run.attempts, 3);
        assert!(run.error.is_some());

        // No staging artifact survives a failed run
        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let server = MockServer::start().await;
        // Downloads fine but has no CVE_Items array: a fatal parse error
        Mock::given(method("GET"))
            .and(path("/feed.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"CVE_data_type": "CVE"}"#))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let pipeline = pipeline_for(&format!("{}/feed.json", server.uri()), dir.path(), store);
        let runner = TaskRunner::new(zero_backoff());

        let (id, outcome) = runner.execute(&pipeline, TriggerSource::Manual).await;
        assert!(matches!(outcome, Err(IngestError::Parse(_))));
        assert_eq!(runner.status(id).unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_after_partial_load_converges() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed_json(&[
                "CVE-2024-0001",
                "CVE-2024-0002",
                "CVE-2024-0003",
                "CVE-2024-0004",
                "CVE-2024-0005",
            ])))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        // First attempt dies after one committed window (batch size 2);
        // clear the fault before the retry fires.
        store.fail_after_windows(1);
        let pipeline = pipeline_for(&format!("{}/feed.json", server.uri()), dir.path(), store.clone());

        let store_for_reset = store.clone();
        let reset = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            store_for_reset.clear_failure();
        });

        let runner = TaskRunner::new(RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(200),
        });
        let (id, outcome) = runner.execute(&pipeline, TriggerSource::Manual).await;
        reset.await.unwrap();

        outcome.unwrap();
        // Every record is present exactly once despite the replay
        assert_eq!(store.len(), 5);
        let run = runner.status(id).unwrap();
        assert_eq!(run.stage, RunStage::Done);
        assert_eq!(run.attempts, 2);
    }

    #[tokio::test]
    async fn test_status_for_unknown_run() {
        let runner = TaskRunner::new(zero_backoff());
        assert!(runner.status(Uuid::new_v4()).is_none());
    }
}
