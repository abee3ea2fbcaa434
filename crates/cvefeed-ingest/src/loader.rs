//! Batch loader
//!
//! Drains the record stream in fixed-size windows. Each window is one
//! bulk upsert against the store followed by one best-effort bulk index;
//! a window that commits stays committed even when a later window or a
//! retry of the whole run fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::models::CveRecord;
use crate::search::SearchIndex;
use crate::store::RecordStore;
use crate::{IngestError, Result};

/// Counters accumulated across one load stage
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct LoadMetrics {
    /// Records written to the store
    pub records_loaded: u64,
    /// Windows committed to the store
    pub windows_committed: u64,
    /// Documents accepted by the search index
    pub indexed: u64,
    /// Documents the search index rejected or that never reached it
    pub index_failures: u64,
}

/// Windows records from a stream into the store and the search index
pub struct BatchLoader {
    store: Arc<dyn RecordStore>,
    index: Arc<dyn SearchIndex>,
    batch_size: usize,
    cancel: Arc<AtomicBool>,
}

impl BatchLoader {
    pub fn new(store: Arc<dyn RecordStore>, index: Arc<dyn SearchIndex>, batch_size: usize) -> Self {
        Self {
            store,
            index,
            batch_size: batch_size.max(1),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancellation flag with the caller. Cancellation is only
    /// observed at window boundaries, so no window is half-written.
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Drain `stream` window by window.
    ///
    /// `on_window` runs after each committed window with the metrics so
    /// far; the pipeline uses it to move run progress. A store failure
    /// or a stream error aborts the stage; index failures only count.
    pub async fn load<I, F>(&self, stream: I, mut on_window: F) -> Result<LoadMetrics>
    where
        I: Iterator<Item = Result<CveRecord>>,
        F: FnMut(&LoadMetrics),
    {
        let mut metrics = LoadMetrics::default();
        let mut window: Vec<CveRecord> = Vec::with_capacity(self.batch_size);
        let mut stream = stream;

        loop {
            window.clear();
            while window.len() < self.batch_size {
                match stream.next() {
                    Some(Ok(record)) => window.push(record),
                    Some(Err(e)) => return Err(e),
                    None => break,
                }
            }
            if window.is_empty() {
                break;
            }

            self.commit_window(&window, &mut metrics).await?;
            on_window(&metrics);

            if self.cancel.load(Ordering::Relaxed) {
                return Err(IngestError::Cancelled(format!(
                    "load stage stopped after {} windows",
                    metrics.windows_committed
                )));
            }
        }

        info!(
            records = metrics.records_loaded,
            windows = metrics.windows_committed,
            indexed = metrics.indexed,
            index_failures = metrics.index_failures,
            "Load stage complete"
        );
        Ok(metrics)
    }

    async fn commit_window(&self, window: &[CveRecord], metrics: &mut LoadMetrics) -> Result<()> {
        self.store.bulk_upsert(window).await?;
        metrics.records_loaded += window.len() as u64;
        metrics.windows_committed += 1;

        match self.index.bulk_index(window).await {
            Ok(outcome) => {
                metrics.indexed += outcome.indexed;
                metrics.index_failures += outcome.failed;
            }
            Err(e) => {
                metrics.index_failures += window.len() as u64;
                warn!(error = %e, window = metrics.windows_committed, "Search indexing failed for window");
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, MemoryIndex, MemoryStore};

    fn ok_stream(records: Vec<CveRecord>) -> impl Iterator<Item = Result<CveRecord>> {
        records.into_iter().map(Ok)
    }

    #[tokio::test]
    async fn test_windows_are_bounded_and_complete() {
        let store = Arc::new(MemoryStore::default());
        let index = Arc::new(MemoryIndex::default());
        let loader = BatchLoader::new(store.clone(), index.clone(), 3);

        let records: Vec<CveRecord> = (0..8).map(|i| record(&format!("CVE-2024-{i:04}"))).collect();
        let metrics = loader.load(ok_stream(records), |_| {}).await.unwrap();

        assert_eq!(metrics.records_loaded, 8);
        assert_eq!(metrics.windows_committed, 3);
        assert_eq!(metrics.indexed, 8);
        assert_eq!(metrics.index_failures, 0);

        // No window exceeded the configured size, and only the last was short
        let sizes = store.window_sizes();
        assert_eq!(sizes, vec![3, 3, 2]);
        assert_eq!(store.len(), 8);
        assert_eq!(index.len(), 8);
    }

    #[tokio::test]
    async fn test_many_windows_stay_bounded() {
        let store = Arc::new(MemoryStore::default());
        let index = Arc::new(MemoryIndex::default());
        let loader = BatchLoader::new(store.clone(), index, 20);

        let records: Vec<CveRecord> =
            (0..500).map(|i| record(&format!("CVE-2024-{i:04}"))).collect();
        let metrics = loader.load(ok_stream(records), |_| {}).await.unwrap();

        assert_eq!(metrics.windows_committed, 25);
        assert!(store.window_sizes().iter().all(|&s| s == 20));
        assert_eq!(store.len(), 500);
    }

    #[tokio::test]
    async fn test_empty_stream_touches_nothing() {
        let store = Arc::new(MemoryStore::default());
        let index = Arc::new(MemoryIndex::default());
        let loader = BatchLoader::new(store.clone(), index.clone(), 1000);

        let metrics = loader.load(ok_stream(vec![]), |_| {}).await.unwrap();
        assert_eq!(metrics.records_loaded, 0);
        assert_eq!(metrics.windows_committed, 0);
        assert_eq!(store.window_sizes().len(), 0);
        assert_eq!(index.len(), 0);
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let store = Arc::new(MemoryStore::default());
        let index = Arc::new(MemoryIndex::default());
        let loader = BatchLoader::new(store.clone(), index.clone(), 2);

        let records: Vec<CveRecord> = (0..5).map(|i| record(&format!("CVE-2024-{i:04}"))).collect();
        loader.load(ok_stream(records.clone()), |_| {}).await.unwrap();
        loader.load(ok_stream(records), |_| {}).await.unwrap();

        assert_eq!(store.len(), 5);
        assert_eq!(index.len(), 5);
    }

    #[tokio::test]
    async fn test_store_failure_aborts_but_keeps_committed_windows() {
        let store = Arc::new(MemoryStore::default());
        store.fail_after_windows(2);
        let index = Arc::new(MemoryIndex::default());
        let loader = BatchLoader::new(store.clone(), index.clone(), 2);

        let records: Vec<CveRecord> = (0..6).map(|i| record(&format!("CVE-2024-{i:04}"))).collect();
        let err = loader.load(ok_stream(records), |_| {}).await.unwrap_err();
        assert!(err.is_transient());

        // The first two windows stay committed
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_index_failure_does_not_abort() {
        let store = Arc::new(MemoryStore::default());
        let index = Arc::new(MemoryIndex::default());
        index.fail_all();
        let loader = BatchLoader::new(store.clone(), index.clone(), 2);

        let records: Vec<CveRecord> = (0..4).map(|i| record(&format!("CVE-2024-{i:04}"))).collect();
        let metrics = loader.load(ok_stream(records), |_| {}).await.unwrap();

        assert_eq!(metrics.records_loaded, 4);
        assert_eq!(metrics.index_failures, 4);
        assert_eq!(metrics.indexed, 0);
        assert_eq!(store.len(), 4);
    }

    #[tokio::test]
    async fn test_stream_error_aborts_stage() {
        let store = Arc::new(MemoryStore::default());
        let index = Arc::new(MemoryIndex::default());
        let loader = BatchLoader::new(store.clone(), index.clone(), 2);

        let stream = vec![
            Ok(record("CVE-2024-0001")),
            Ok(record("CVE-2024-0002")),
            Err(IngestError::Parse("artifact truncated".to_string())),
        ]
        .into_iter();

        let err = loader.load(stream, |_| {}).await.unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));
        // The full first window committed before the error surfaced
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_at_window_boundary() {
        let store = Arc::new(MemoryStore::default());
        let index = Arc::new(MemoryIndex::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let loader =
            BatchLoader::new(store.clone(), index.clone(), 2).with_cancel_flag(cancel.clone());

        let records: Vec<CveRecord> = (0..6).map(|i| record(&format!("CVE-2024-{i:04}"))).collect();
        let cancel_after_first = cancel.clone();
        let err = loader
            .load(ok_stream(records), move |m| {
                if m.windows_committed == 1 {
                    cancel_after_first.store(true, Ordering::Relaxed);
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, IngestError::Cancelled(_)));
        // Exactly one whole window committed, nothing half-written
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_progress_callback_sees_each_window() {
        let store = Arc::new(MemoryStore::default());
        let index = Arc::new(MemoryIndex::default());
        let loader = BatchLoader::new(store, index, 2);

        let records: Vec<CveRecord> = (0..5).map(|i| record(&format!("CVE-2024-{i:04}"))).collect();
        let mut seen = Vec::new();
        loader
            .load(ok_stream(records), |m| seen.push(m.windows_committed))
            .await
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3]);
    }
}
