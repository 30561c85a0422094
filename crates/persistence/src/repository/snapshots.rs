//! Ranked rows of each daily run, kept for the read-only API

use crate::{content_hash, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SnapshotRecord {
    pub id: Option<i64>,
    pub row_hash: String,
    pub run_date: String,
    pub rank: i64,
    pub symbol: String,
    pub market: String,
    pub name: Option<String>,
    pub strategy: String,
    pub composite_score: f64,
    pub position_size: String,
    pub ratio: Option<f64>,
    pub ratio_status: String,
    pub regime: Option<String>,
    pub record_json: String,
}

/// Input row for [`SnapshotRepository::save_run`]
#[derive(Debug, Clone)]
pub struct NewSnapshotRow {
    pub symbol: String,
    pub market: String,
    pub name: Option<String>,
    pub strategy: String,
    pub composite_score: f64,
    pub position_size: String,
    pub ratio: Option<f64>,
    pub ratio_status: String,
    pub record_json: String,
}

pub struct SnapshotRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SnapshotRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Store one run's ranked rows, replacing any earlier run for the same date.
    /// Rows are ranked in the order given, starting at 1.
    pub async fn save_run(
        &self,
        run_date: &str,
        regime: &str,
        rows: &[NewSnapshotRow],
    ) -> DbResult<usize> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM run_snapshots WHERE run_date = ?")
            .bind(run_date)
            .execute(&mut *tx)
            .await?;

        for (i, row) in rows.iter().enumerate() {
            let row_hash = content_hash(&[run_date, &row.symbol, &row.market]);
            sqlx::query(
                r#"INSERT INTO run_snapshots
                    (row_hash, run_date, rank, symbol, market, name, strategy,
                     composite_score, position_size, ratio, ratio_status, regime, record_json)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                   ON CONFLICT(row_hash) DO UPDATE SET
                     rank = excluded.rank,
                     strategy = excluded.strategy,
                     composite_score = excluded.composite_score,
                     position_size = excluded.position_size,
                     record_json = excluded.record_json"#,
            )
            .bind(&row_hash)
            .bind(run_date)
            .bind((i + 1) as i64)
            .bind(&row.symbol)
            .bind(&row.market)
            .bind(&row.name)
            .bind(&row.strategy)
            .bind(row.composite_score)
            .bind(&row.position_size)
            .bind(row.ratio)
            .bind(&row.ratio_status)
            .bind(regime)
            .bind(&row.record_json)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(run_date, count = rows.len(), "Saved run snapshot");
        Ok(rows.len())
    }

    pub async fn latest_run_date(&self) -> DbResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT run_date FROM run_snapshots ORDER BY run_date DESC LIMIT 1")
                .fetch_optional(self.pool)
                .await?;
        Ok(row.map(|r| r.0))
    }

    /// Rows of one run in rank order
    pub async fn get_run(&self, run_date: &str) -> DbResult<Vec<SnapshotRecord>> {
        let records = sqlx::query_as::<_, SnapshotRecord>(
            r#"SELECT id, row_hash, run_date, rank, symbol, market, name, strategy,
                      composite_score, position_size, ratio, ratio_status, regime, record_json
               FROM run_snapshots
               WHERE run_date = ?
               ORDER BY rank"#,
        )
        .bind(run_date)
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }
}
