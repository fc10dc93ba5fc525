use async_trait::async_trait;
use libsql::params;
use tracing::{Instrument, Span, debug, error, warn};

use super::error::{DbError, FailureKind};
use super::models::{Measurement, UrlId, format_timestamp, parse_timestamp};
use super::schema::Tables;
use crate::pool::LibsqlPool;

/// Result of `insert_batch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every row of the batch is committed
    Committed(usize),
    /// The batch was empty; nothing was sent to the backend.
    ///
    /// Reported as a failure so an idle drain can be told apart from a write.
    Empty,
    /// The transaction was rolled back; no row of the batch is stored
    Failed(FailureKind),
}

impl BatchOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, BatchOutcome::Committed(_))
    }
}

/// Destination of drained measurements.
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    /// Commit `measurements` atomically.
    async fn insert_batch(&self, measurements: &[Measurement]) -> BatchOutcome;
}

/// Durable, append-only storage of measurements.
pub struct MeasurementStore {
    tables: Tables,
    pool: LibsqlPool,
    span: Span,
}

impl MeasurementStore {
    pub fn new(tables: Tables, pool: LibsqlPool, span: Span) -> Self {
        Self { tables, pool, span }
    }

    async fn write_batch(&self, batch: &[&Measurement]) -> Result<usize, DbError> {
        let sql = format!(
            "INSERT INTO {} (sample_timestamp, url_id, response_code, response_time, match_found) VALUES (?, ?, ?, ?, ?)",
            self.tables.metrics
        );

        let conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        for measurement in batch {
            let inserted = tx
                .execute(
                    &sql,
                    params![
                        format_timestamp(&measurement.sample_timestamp),
                        measurement.url_id,
                        measurement.response_code,
                        measurement.response_time,
                        if measurement.match_found { 1 } else { 0 }
                    ],
                )
                .await;

            if let Err(err) = inserted {
                if let Err(rollback_err) = tx.rollback().await {
                    error!("Rollback failed: {}", rollback_err);
                }
                return Err(err.into());
            }
        }

        tx.commit().await?;
        Ok(batch.len())
    }

    /// Most recent measurements of a target, newest first
    pub async fn recent(&self, url_id: UrlId, limit: usize) -> Result<Vec<Measurement>, DbError> {
        let conn = self.pool.get().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT sample_timestamp, url_id, response_code, response_time, match_found FROM {} WHERE url_id = ? ORDER BY sample_timestamp DESC LIMIT ?",
                    self.tables.metrics
                ),
                params![url_id, i64::try_from(limit).unwrap_or(i64::MAX)],
            )
            .await?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await? {
            let timestamp: String = row.get(0)?;
            results.push(Measurement {
                sample_timestamp: parse_timestamp(&timestamp)?,
                url_id: row.get(1)?,
                response_code: row.get(2)?,
                response_time: row.get(3)?,
                match_found: row.get::<i64>(4)? != 0,
            });
        }
        Ok(results)
    }

    /// Number of stored measurements, optionally for a single target
    pub async fn count(&self, url_id: Option<UrlId>) -> Result<u64, DbError> {
        let conn = self.pool.get().await?;
        let mut rows = match url_id {
            Some(url_id) => {
                conn.query(
                    &format!("SELECT COUNT(*) FROM {} WHERE url_id = ?", self.tables.metrics),
                    params![url_id],
                )
                .await?
            }
            None => conn.query(&format!("SELECT COUNT(*) FROM {}", self.tables.metrics), ()).await?,
        };

        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl MeasurementSink for MeasurementStore {
    async fn insert_batch(&self, measurements: &[Measurement]) -> BatchOutcome {
        if measurements.is_empty() {
            debug!(parent: &self.span, "insert_batch called with no measurements");
            return BatchOutcome::Empty;
        }

        // Rows carry their own identity, so any order is as good as another
        let mut batch: Vec<&Measurement> = measurements.iter().collect();
        batch.sort_by_key(|m| m.key());

        match self.write_batch(&batch).instrument(self.span.clone()).await {
            Ok(count) => {
                debug!(parent: &self.span, count, "Committed measurement batch");
                BatchOutcome::Committed(count)
            }
            Err(err) => {
                let kind = err.kind();
                warn!(parent: &self.span, %kind, rows = batch.len(), "Measurement batch rolled back: {}", err);
                BatchOutcome::Failed(kind)
            }
        }
    }
}
