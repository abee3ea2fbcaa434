//! Search index collaborator
//!
//! Elasticsearch-backed secondary index over the ingested records.
//! Indexing is best effort: the loader logs and counts failures here
//! but never aborts a run because of them. Documents are keyed by
//! `cve_id`, so replaying a window overwrites instead of duplicating.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::SearchConfig;
use crate::models::CveRecord;
use crate::{IngestError, Result};

/// Result of one bulk index request
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct BulkIndexOutcome {
    pub indexed: u64,
    pub failed: u64,
}

/// Search collaborator used by the batch loader and the pipeline
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create the index with its mappings when it does not exist yet.
    /// Idempotent.
    async fn ensure_index(&self) -> Result<()>;

    /// Index one window of records, keyed by `cve_id`.
    ///
    /// Per-document rejections are reported in the outcome, not as an
    /// error; `Err` means the request as a whole failed.
    async fn bulk_index(&self, records: &[CveRecord]) -> Result<BulkIndexOutcome>;
}

/// Elasticsearch implementation of [`SearchIndex`]
#[derive(Clone)]
pub struct ElasticIndex {
    client: Client,
    config: SearchConfig,
}

impl ElasticIndex {
    pub fn new(config: SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| IngestError::Index(format!("failed to build search client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn index_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.index_name
        )
    }

    fn mappings() -> serde_json::Value {
        json!({
            "mappings": {
                "properties": {
                    "cve_id": {"type": "keyword"},
                    "description": {"type": "text"},
                    "published_date": {
                        "type": "date",
                        "format": "yyyy-MM-dd'T'HH:mmX||strict_date_optional_time"
                    },
                    "last_modified_date": {
                        "type": "date",
                        "format": "yyyy-MM-dd'T'HH:mmX||strict_date_optional_time"
                    },
                    "cvss_v3_score": {"type": "float"},
                    "severity": {"type": "keyword"},
                    "references": {
                        "type": "nested",
                        "properties": {
                            "url": {"type": "keyword"},
                            "source": {"type": "keyword"}
                        }
                    },
                    "raw_data": {"type": "object", "enabled": false}
                }
            }
        })
    }

    fn document(record: &CveRecord) -> serde_json::Value {
        json!({
            "cve_id": record.cve_id,
            "description": record.description,
            "published_date": record.published_date,
            "last_modified_date": record.last_modified_date,
            "cvss_v3_score": record.cvss_v3_score,
            "severity": record.severity,
            "references": record.references,
            "raw_data": record.raw_data,
        })
    }
}

#[async_trait]
impl SearchIndex for ElasticIndex {
    async fn ensure_index(&self) -> Result<()> {
        let url = self.index_url();

        let exists = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| IngestError::Index(format!("index existence check failed: {}", e)))?;
        if exists.status().is_success() {
            debug!(index = %self.config.index_name, "Index already exists");
            return Ok(());
        }

        let response = self
            .client
            .put(&url)
            .json(&Self::mappings())
            .send()
            .await
            .map_err(|e| IngestError::Index(format!("index creation failed: {}", e)))?;

        // A concurrent run may have created it between the check and the
        // PUT; resource_already_exists comes back as 400.
        if response.status().is_success() || response.status() == reqwest::StatusCode::BAD_REQUEST {
            debug!(index = %self.config.index_name, "Index ready");
            Ok(())
        } else {
            Err(IngestError::Index(format!(
                "index creation returned {}",
                response.status()
            )))
        }
    }

    async fn bulk_index(&self, records: &[CveRecord]) -> Result<BulkIndexOutcome> {
        if records.is_empty() {
            return Ok(BulkIndexOutcome::default());
        }

        let mut body = String::new();
        for record in records {
            let action = json!({"index": {"_id": record.cve_id}});
            body.push_str(&action.to_string());
            body.push('\n');
            body.push_str(&Self::document(record).to_string());
            body.push('\n');
        }

        let response = self
            .client
            .post(format!("{}/_bulk", self.index_url()))
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| IngestError::Index(format!("bulk index request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(IngestError::Index(format!(
                "bulk index returned {}",
                response.status()
            )));
        }

        let parsed: serde_json::Value = response
            .json()
            .await
            .map_err(|e| IngestError::Index(format!("bulk index response unreadable: {}", e)))?;

        let mut outcome = BulkIndexOutcome {
            indexed: records.len() as u64,
            failed: 0,
        };

        if parsed.get("errors").and_then(|v| v.as_bool()).unwrap_or(false) {
            let failed = parsed
                .get("items")
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter(|item| {
                            item.pointer("/index/status")
                                .and_then(|s| s.as_u64())
                                .map(|s| s >= 300)
                                .unwrap_or(true)
                        })
                        .count() as u64
                })
                .unwrap_or(0);
            outcome.failed = failed;
            outcome.indexed = (records.len() as u64).saturating_sub(failed);
            warn!(failed, "Some documents were rejected by the search index");
        }

        Ok(outcome)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record(id: &str) -> CveRecord {
        CveRecord {
            cve_id: id.to_string(),
            description: "test".to_string(),
            published_date: "2024-01-01T00:00Z".to_string(),
            last_modified_date: "2024-01-01T00:00Z".to_string(),
            cvss_v3_score: Some(5.0),
            severity: Some("MEDIUM".to_string()),
            references: vec![],
            raw_data: serde_json::json!({}),
        }
    }

    fn index_for(server: &MockServer) -> ElasticIndex {
        ElasticIndex::new(SearchConfig {
            base_url: server.uri(),
            index_name: "cve_items".to_string(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_index_skips_put_when_index_exists() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/cve_items"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        index_for(&server).ensure_index().await.unwrap();
    }

    #[tokio::test]
    async fn test_ensure_index_creates_missing_index() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/cve_items"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/cve_items"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "acknowledged": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        index_for(&server).ensure_index().await.unwrap();
    }

    #[tokio::test]
    async fn test_bulk_index_counts_rejected_documents() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cve_items/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errors": true,
                "items": [
                    {"index": {"_id": "CVE-2024-0001", "status": 201}},
                    {"index": {"_id": "CVE-2024-0002", "status": 400}}
                ]
            })))
            .mount(&server)
            .await;

        let outcome = index_for(&server)
            .bulk_index(&[record("CVE-2024-0001"), record("CVE-2024-0002")])
            .await
            .unwrap();
        assert_eq!(outcome.indexed, 1);
        assert_eq!(outcome.failed, 1);
    }

    #[tokio::test]
    async fn test_bulk_index_empty_window_is_noop() {
        let server = MockServer::start().await;
        let outcome = index_for(&server).bulk_index(&[]).await.unwrap();
        assert_eq!(outcome.indexed, 0);
        assert_eq!(outcome.failed, 0);
    }

    #[tokio::test]
    async fn test_bulk_index_server_error_is_index_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cve_items/_bulk"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = index_for(&server)
            .bulk_index(&[record("CVE-2024-0001")])
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Index(_)));
        assert!(!err.is_transient());
    }
}
