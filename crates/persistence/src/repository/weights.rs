//! Strategy weight state: the weights used by the previous run, read back as
//! the prior for the next run's smoothing step.

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WeightStateRecord {
    pub strategy: String,
    pub weight: f64,
    pub updated_on: String,
}

/// The full persisted state: one weight per strategy label plus the date
/// of the run that wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredWeights {
    pub updated_on: String,
    pub weights: BTreeMap<String, f64>,
}

pub struct WeightStateRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> WeightStateRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Load the persisted weights. `None` when nothing has been saved yet.
    pub async fn load(&self) -> DbResult<Option<StoredWeights>> {
        let rows = sqlx::query_as::<_, WeightStateRecord>(
            "SELECT strategy, weight, updated_on FROM strategy_weight_state ORDER BY strategy",
        )
        .fetch_all(self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }

        let updated_on = rows
            .iter()
            .map(|r| r.updated_on.clone())
            .max()
            .unwrap_or_default();
        let weights = rows
            .into_iter()
            .filter(|r| r.weight.is_finite())
            .map(|r| (r.strategy, r.weight))
            .collect();

        Ok(Some(StoredWeights {
            updated_on,
            weights,
        }))
    }

    /// Replace the whole state in one transaction
    pub async fn save(&self, updated_on: &str, weights: &BTreeMap<String, f64>) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM strategy_weight_state")
            .execute(&mut *tx)
            .await?;

        for (strategy, weight) in weights {
            sqlx::query(
                "INSERT INTO strategy_weight_state (strategy, weight, updated_on) VALUES (?1, ?2, ?3)",
            )
            .bind(strategy)
            .bind(weight)
            .bind(updated_on)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(count = weights.len(), updated_on, "Saved strategy weight state");
        Ok(())
    }
}
