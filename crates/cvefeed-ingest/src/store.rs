//! Primary record store
//!
//! Postgres-backed persistence for CVE records. Writes go through a
//! single multi-row upsert per window so a window is all-or-nothing
//! from the loader's point of view.

use async_trait::async_trait;
use sqlx::{PgPool, QueryBuilder};
use tracing::debug;

use crate::models::CveRecord;
use crate::{IngestError, Result};

/// Store collaborator used by the batch loader
///
/// `bulk_upsert` must be idempotent: replaying a window that was already
/// committed converges to the same terminal state.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Write one window of records, keyed by `cve_id`.
    ///
    /// Existing rows are updated in place; `cve_id` itself is never
    /// rewritten. Returns the number of rows written.
    async fn bulk_upsert(&self, records: &[CveRecord]) -> Result<u64>;
}

/// Postgres implementation of [`RecordStore`]
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `cve_items` table when it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cve_items (
                cve_id TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                published_date TEXT NOT NULL,
                last_modified_date TEXT NOT NULL,
                cvss_v3_score DOUBLE PRECISION,
                severity TEXT,
                "references" JSONB NOT NULL DEFAULT '[]'::jsonb,
                raw_data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn bulk_upsert(&self, records: &[CveRecord]) -> Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        // Serialize the JSONB columns up front so the builder loop below
        // stays infallible.
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let references = serde_json::to_value(&record.references).map_err(|e| {
                IngestError::Store {
                    message: format!("failed to serialize references for {}: {}", record.cve_id, e),
                    transient: false,
                }
            })?;
            rows.push((record, references));
        }

        let mut builder = QueryBuilder::new(
            r#"INSERT INTO cve_items
               (cve_id, description, published_date, last_modified_date,
                cvss_v3_score, severity, "references", raw_data) "#,
        );

        builder.push_values(rows, |mut b, (record, references)| {
            b.push_bind(&record.cve_id)
                .push_bind(&record.description)
                .push_bind(&record.published_date)
                .push_bind(&record.last_modified_date)
                .push_bind(record.cvss_v3_score)
                .push_bind(&record.severity)
                .push_bind(references)
                .push_bind(&record.raw_data);
        });

        builder.push(
            r#" ON CONFLICT (cve_id) DO UPDATE SET
                description = EXCLUDED.description,
                last_modified_date = EXCLUDED.last_modified_date,
                cvss_v3_score = EXCLUDED.cvss_v3_score,
                severity = EXCLUDED.severity,
                "references" = EXCLUDED."references",
                raw_data = EXCLUDED.raw_data,
                updated_at = NOW()"#,
        );

        let result = builder.build().execute(&self.pool).await?;
        let written = result.rows_affected();
        debug!(records = records.len(), written, "Bulk upsert complete");
        Ok(written)
    }
}
