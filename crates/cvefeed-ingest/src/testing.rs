//! Test doubles and fixture builders
//!
//! In-memory collaborators so loader and pipeline behavior can be
//! exercised without a live Postgres or Elasticsearch. Compiled into
//! the crate so integration tests can share them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::models::{CveRecord, CveReference};
use crate::search::{BulkIndexOutcome, SearchIndex};
use crate::store::RecordStore;
use crate::{IngestError, Result};

/// Build a minimal valid record for tests
pub fn record(cve_id: &str) -> CveRecord {
    CveRecord {
        cve_id: cve_id.to_string(),
        description: format!("Description of {}", cve_id),
        published_date: "2024-01-01T00:00Z".to_string(),
        last_modified_date: "2024-01-02T00:00Z".to_string(),
        cvss_v3_score: Some(5.0),
        severity: Some("MEDIUM".to_string()),
        references: vec![CveReference {
            url: format!("http://example.com/{}", cve_id),
            source: Some("MISC".to_string()),
        }],
        raw_data: serde_json::json!({"cve": {"CVE_data_meta": {"ID": cve_id}}}),
    }
}

/// Render a feed document in the NVD 1.1 shape for the given IDs
pub fn feed_json(cve_ids: &[&str]) -> String {
    let items: Vec<String> = cve_ids
        .iter()
        .map(|id| {
            format!(
                r#"{{
                    "cve": {{
                        "CVE_data_meta": {{"ID": "{id}"}},
                        "description": {{"description_data": [{{"lang": "en", "value": "Description of {id}"}}]}},
                        "references": {{"reference_data": [{{"url": "http://example.com/{id}", "refsource": "MISC"}}]}}
                    }},
                    "impact": {{"baseMetricV3": {{"cvssV3": {{"baseScore": 5.0, "baseSeverity": "MEDIUM"}}}}}},
                    "publishedDate": "2024-01-01T00:00Z",
                    "lastModifiedDate": "2024-01-02T00:00Z"
                }}"#
            )
        })
        .collect();
    format!(
        r#"{{"CVE_data_type": "CVE", "CVE_Items": [{}]}}"#,
        items.join(",")
    )
}

/// In-memory [`RecordStore`] that records window sizes and can be told
/// to fail once a number of windows have committed
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<String, CveRecord>>,
    windows: Mutex<Vec<usize>>,
    fail_after: Mutex<Option<usize>>,
}

impl MemoryStore {
    /// Succeed for the first `n` windows, then reject with a transient
    /// store error until cleared.
    pub fn fail_after_windows(&self, n: usize) {
        *self.fail_after.lock().unwrap() = Some(n);
    }

    pub fn clear_failure(&self) {
        *self.fail_after.lock().unwrap() = None;
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, cve_id: &str) -> Option<CveRecord> {
        self.rows.lock().unwrap().get(cve_id).cloned()
    }

    /// Sizes of every window committed so far, in commit order
    pub fn window_sizes(&self) -> Vec<usize> {
        self.windows.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn bulk_upsert(&self, records: &[CveRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        if let Some(limit) = *self.fail_after.lock().unwrap() {
            if self.windows.lock().unwrap().len() >= limit {
                return Err(IngestError::Store {
                    message: "injected store failure".to_string(),
                    transient: true,
                });
            }
        }

        let mut rows = self.rows.lock().unwrap();
        for record in records {
            rows.insert(record.cve_id.clone(), record.clone());
        }
        self.windows.lock().unwrap().push(records.len());
        Ok(records.len() as u64)
    }
}

/// In-memory [`SearchIndex`] with switchable failure injection
#[derive(Default)]
pub struct MemoryIndex {
    docs: Mutex<HashMap<String, CveRecord>>,
    fail: AtomicBool,
    ensure_calls: AtomicUsize,
}

impl MemoryIndex {
    /// Make every bulk request fail until cleared
    pub fn fail_all(&self) {
        self.fail.store(true, Ordering::Relaxed);
    }

    pub fn clear_failure(&self) {
        self.fail.store(false, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.docs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, cve_id: &str) -> Option<CveRecord> {
        self.docs.lock().unwrap().get(cve_id).cloned()
    }

    pub fn ensure_calls(&self) -> usize {
        self.ensure_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn ensure_index(&self) -> Result<()> {
        self.ensure_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail.load(Ordering::Relaxed) {
            return Err(IngestError::Index("injected index failure".to_string()));
        }
        Ok(())
    }

    async fn bulk_index(&self, records: &[CveRecord]) -> Result<BulkIndexOutcome> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(IngestError::Index("injected index failure".to_string()));
        }
        let mut docs = self.docs.lock().unwrap();
        for record in records {
            docs.insert(record.cve_id.clone(), record.clone());
        }
        Ok(BulkIndexOutcome {
            indexed: records.len() as u64,
            failed: 0,
        })
    }
}
