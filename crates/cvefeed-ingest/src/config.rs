//! Ingestion configuration
//!
//! Environment-driven configuration for the feed ingestion pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::{IngestError, Result, DEFAULT_BACKOFF_BASE_SECS, DEFAULT_BATCH_SIZE, DEFAULT_MAX_ATTEMPTS};

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Remote feed URL (required; an empty URL is a fatal configuration error)
    pub feed_url: String,
    /// Directory for staging artifacts
    pub staging_dir: PathBuf,
    /// Records per load window
    pub batch_size: usize,
    /// HTTP timeout for the feed download in seconds
    pub fetch_timeout_secs: u64,
    /// Maximum run attempts before giving up
    pub max_attempts: u32,
    /// Base delay between retry attempts in seconds
    pub backoff_base_secs: u64,
    /// Search index configuration
    pub search: SearchConfig,
}

/// Search-index collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Elasticsearch base URL
    pub base_url: String,
    /// Index name for CVE documents
    pub index_name: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl PipelineConfig {
    /// Load pipeline configuration from environment variables
    ///
    /// Environment variables:
    /// - `NVD_FEED_URL`: remote feed URL (required)
    /// - `INGEST_STAGING_DIR`: staging directory (default platform temp dir)
    /// - `INGEST_BATCH_SIZE`: records per window (default 1000)
    /// - `INGEST_FETCH_TIMEOUT_SECS`: download timeout (default 60)
    /// - `INGEST_MAX_ATTEMPTS`: run retry ceiling (default 3)
    /// - `INGEST_BACKOFF_BASE_SECS`: retry backoff base (default 60)
    /// - `ELASTICSEARCH_URL`: search index base URL (default http://localhost:9200)
    /// - `ELASTICSEARCH_INDEX`: index name (default cve_items)
    pub fn from_env() -> Result<Self> {
        let config = Self {
            feed_url: std::env::var("NVD_FEED_URL").unwrap_or_default(),
            staging_dir: std::env::var("INGEST_STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("cvefeed-staging")),
            batch_size: std::env::var("INGEST_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
            fetch_timeout_secs: std::env::var("INGEST_FETCH_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),
            max_attempts: std::env::var("INGEST_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            backoff_base_secs: std::env::var("INGEST_BACKOFF_BASE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BACKOFF_BASE_SECS),
            search: SearchConfig::from_env(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// A missing feed URL is fatal and never retried.
    pub fn validate(&self) -> Result<()> {
        if self.feed_url.trim().is_empty() {
            return Err(IngestError::Config(
                "NVD_FEED_URL is not configured".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(IngestError::Config(
                "INGEST_BATCH_SIZE must be greater than 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(IngestError::Config(
                "INGEST_MAX_ATTEMPTS must be greater than 0".to_string(),
            ));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(IngestError::Config(
                "INGEST_FETCH_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Get fetch timeout as Duration
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Get backoff base as Duration
    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_secs)
    }

    /// Configuration suitable for tests: tiny windows, no backoff delay.
    pub fn test_config(feed_url: &str, staging_dir: &std::path::Path) -> Self {
        Self {
            feed_url: feed_url.to_string(),
            staging_dir: staging_dir.to_path_buf(),
            batch_size: 2,
            fetch_timeout_secs: 5,
            max_attempts: 3,
            backoff_base_secs: 0,
            search: SearchConfig::default(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            feed_url: String::new(),
            staging_dir: std::env::temp_dir().join("cvefeed-staging"),
            batch_size: DEFAULT_BATCH_SIZE,
            fetch_timeout_secs: 60,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            search: SearchConfig::default(),
        }
    }
}

impl SearchConfig {
    /// Load search configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("ELASTICSEARCH_URL")
                .unwrap_or_else(|_| "http://localhost:9200".to_string()),
            index_name: std::env::var("ELASTICSEARCH_INDEX")
                .unwrap_or_else(|_| "cve_items".to_string()),
            timeout_secs: std::env::var("ELASTICSEARCH_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(30),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9200".to_string(),
            index_name: "cve_items".to_string(),
            timeout_secs: 30,
        }
    }
}
