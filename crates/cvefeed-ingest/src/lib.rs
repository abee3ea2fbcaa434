//! CVE Feed Ingestion Pipeline
//!
//! This crate ingests the NVD vulnerability feed into a primary store
//! (PostgreSQL) and a search index (Elasticsearch), surviving network
//! faults, malformed records, and partial failures without losing
//! already-committed progress or exhausting memory.
//!
//! Architecture:
//! - Fetch: streaming HTTP download to a local staging artifact
//! - Parse: incremental extraction of CVE records from the staging artifact
//! - Load: fixed-size windows, one idempotent bulk upsert + one best-effort
//!   bulk index per window, committed window by window
//! - Orchestrate: FETCH -> LOAD -> INDEX_SETUP state machine with run-scoped
//!   progress, wrapped by a retrying task substrate
//!
//! Feed source:
//! - NVD recent feed: https://nvd.nist.gov/feeds/json/cve/1.1/nvdcve-1.1-recent.json.gz

pub mod cache;
pub mod config;
pub mod fetcher;
pub mod loader;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod run;
pub mod search;
pub mod store;
pub mod task;
pub mod testing;

// Re-export main types
pub use cache::{cache_key, InMemoryCache, ResultCache, CACHE_VERSION};
pub use config::{PipelineConfig, SearchConfig};
pub use fetcher::{FeedFetcher, FetchMetrics};
pub use loader::{BatchLoader, LoadMetrics};
pub use models::{CveRecord, CveReference, FeedArtifact};
pub use parser::{FeedParser, ParseStats, RecordStream};
pub use pipeline::IngestPipeline;
pub use run::{PipelineRun, RunMetrics, RunStage, TriggerSource};
pub use search::{BulkIndexOutcome, ElasticIndex, SearchIndex};
pub use store::{PgRecordStore, RecordStore};
pub use task::{ProgressHandle, RetryPolicy, TaskRunner};

// Batch size constants
pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BACKOFF_BASE_SECS: u64 = 60;

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Error types for feed ingestion
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Fatal configuration problem. Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network-level failure during fetch (timeout, non-2xx status,
    /// decompression). Transient: the task substrate retries the run.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Batch write rejected by the store. Connection-level failures are
    /// transient; constraint and schema violations are fatal.
    #[error("Store error: {message}")]
    Store { message: String, transient: bool },

    /// Search-index failure. Logged and counted by the loader, never
    /// aborts a run.
    #[error("Search index error: {0}")]
    Index(String),

    /// Structural failure reading or decoding the staging artifact.
    /// Per-element parse failures are absorbed by the parser and do not
    /// surface here.
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Run abandoned at a window boundary.
    #[error("Run cancelled: {0}")]
    Cancelled(String),
}

impl IngestError {
    /// Whether the task substrate should re-execute the whole run.
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::Transport(_) => true,
            IngestError::Store { transient, .. } => *transient,
            IngestError::Io(_) => true,
            IngestError::Config(_)
            | IngestError::Parse(_)
            | IngestError::Index(_)
            | IngestError::Cancelled(_) => false,
        }
    }

    /// Classify a store failure. Connection-level sqlx errors feed the
    /// retry policy; everything else (constraint, schema, decode) is fatal.
    pub fn from_store(err: sqlx::Error) -> Self {
        let transient = matches!(
            err,
            sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed
        );
        IngestError::Store {
            message: err.to_string(),
            transient,
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        IngestError::Transport(err.to_string())
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::from_store(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_is_transient() {
        let err = IngestError::Transport("connection reset".to_string());
        assert!(err.is_transient());
    }

    #[test]
    fn test_config_is_fatal() {
        let err = IngestError::Config("feed URL not configured".to_string());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_store_transient_flag() {
        let transient = IngestError::Store {
            message: "pool timed out".to_string(),
            transient: true,
        };
        let fatal = IngestError::Store {
            message: "unique violation".to_string(),
            transient: false,
        };
        assert!(transient.is_transient());
        assert!(!fatal.is_transient());
    }

    #[test]
    fn test_error_display_includes_cause() {
        let err = IngestError::Store {
            message: "pool timed out".to_string(),
            transient: true,
        };
        assert_eq!(err.to_string(), "Store error: pool timed out");

        let err = IngestError::Transport("connection reset".to_string());
        assert_eq!(err.to_string(), "Transport error: connection reset");
    }

    #[test]
    fn test_index_never_transient() {
        let err = IngestError::Index("bulk request failed".to_string());
        assert!(!err.is_transient());
    }
}
