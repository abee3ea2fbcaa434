//! Canonical record types for the ingestion pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A reference link attached to a CVE record
///
/// Owned exclusively by its record; the URL is required, the source
/// label is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CveReference {
    pub url: String,
    pub source: Option<String>,
}

/// The canonical parsed vulnerability record
///
/// Immutable once constructed by the parser. `raw_data` carries the
/// untransformed feed element for audit and debugging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CveRecord {
    /// Unique identifier, stable across feed versions (e.g., CVE-2024-12345)
    pub cve_id: String,
    pub description: String,
    /// ISO-8601 timestamp string, passed through from the feed unvalidated
    pub published_date: String,
    /// ISO-8601 timestamp string, passed through from the feed unvalidated
    pub last_modified_date: String,
    /// CVSS v3 base score, absent when the feed omits the metrics block
    pub cvss_v3_score: Option<f64>,
    /// CVSS v3 base severity category (LOW/MEDIUM/HIGH/CRITICAL)
    pub severity: Option<String>,
    pub references: Vec<CveReference>,
    /// Original feed element, preserved verbatim
    pub raw_data: serde_json::Value,
}

/// One fetched copy of the remote feed, staged on local storage
///
/// Exclusively owned by the pipeline run that created it and deleted on
/// every exit path.
#[derive(Debug, Clone)]
pub struct FeedArtifact {
    pub path: PathBuf,
    pub source_url: String,
    pub size_bytes: u64,
    pub fetched_at: DateTime<Utc>,
}

impl FeedArtifact {
    /// Remove the staging file. Missing files are not an error: cleanup
    /// runs on every exit path and may race an earlier cleanup.
    pub async fn remove(&self) -> std::io::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serde_round_trip() {
        let record = CveRecord {
            cve_id: "CVE-2024-0001".to_string(),
            description: "Buffer overflow in example".to_string(),
            published_date: "2024-01-01T00:00Z".to_string(),
            last_modified_date: "2024-01-02T00:00Z".to_string(),
            cvss_v3_score: Some(9.8),
            severity: Some("CRITICAL".to_string()),
            references: vec![CveReference {
                url: "http://example.com/advisory".to_string(),
                source: Some("MISC".to_string()),
            }],
            raw_data: serde_json::json!({"cve": {}}),
        };

        let json = serde_json::to_string(&record).unwrap();
        let back: CveRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn test_artifact_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        tokio::fs::write(&path, b"{}").await.unwrap();

        let artifact = FeedArtifact {
            path: path.clone(),
            source_url: "http://example.com/feed".to_string(),
            size_bytes: 2,
            fetched_at: Utc::now(),
        };

        artifact.remove().await.unwrap();
        assert!(!path.exists());
        // Second removal must not error
        artifact.remove().await.unwrap();
    }
}
