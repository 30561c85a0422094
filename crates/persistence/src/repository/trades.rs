//! Closed-trade history

use crate::{content_hash, DbResult};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A realized trade. Dates are ISO `YYYY-MM-DD`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClosedTradeRecord {
    pub id: Option<i64>,
    pub trade_hash: String,
    pub symbol: String,
    pub market: String,
    pub strategy: String,
    pub entry_date: String,
    pub exit_date: String,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl_pct: f64,
}

impl ClosedTradeRecord {
    /// Build a record, deriving `pnl_pct` from the prices and the dedupe hash
    /// from every identifying field.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: &str,
        market: &str,
        strategy: &str,
        entry_date: &str,
        exit_date: &str,
        entry_price: f64,
        exit_price: f64,
    ) -> Self {
        let pnl_pct = if entry_price > 0.0 {
            (exit_price - entry_price) / entry_price * 100.0
        } else {
            0.0
        };
        let trade_hash = content_hash(&[
            symbol,
            market,
            strategy,
            entry_date,
            exit_date,
            &entry_price.to_string(),
            &exit_price.to_string(),
        ]);
        Self {
            id: None,
            trade_hash,
            symbol: symbol.to_string(),
            market: market.to_string(),
            strategy: strategy.to_string(),
            entry_date: entry_date.to_string(),
            exit_date: exit_date.to_string(),
            entry_price,
            exit_price,
            pnl_pct,
        }
    }
}

pub struct ClosedTradeRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ClosedTradeRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a trade; returns false when the same trade was already stored
    pub async fn insert(&self, trade: &ClosedTradeRecord) -> DbResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO closed_trades
                (trade_hash, symbol, market, strategy, entry_date, exit_date,
                 entry_price, exit_price, pnl_pct)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
               ON CONFLICT(trade_hash) DO NOTHING"#,
        )
        .bind(&trade.trade_hash)
        .bind(&trade.symbol)
        .bind(&trade.market)
        .bind(&trade.strategy)
        .bind(&trade.entry_date)
        .bind(&trade.exit_date)
        .bind(trade.entry_price)
        .bind(trade.exit_price)
        .bind(trade.pnl_pct)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All trades, grouped by strategy and ordered by exit date
    pub async fn get_all(&self) -> DbResult<Vec<ClosedTradeRecord>> {
        let records = sqlx::query_as::<_, ClosedTradeRecord>(
            r#"SELECT id, trade_hash, symbol, market, strategy, entry_date, exit_date,
                      entry_price, exit_price, pnl_pct
               FROM closed_trades
               ORDER BY strategy, exit_date, id"#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(records)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM closed_trades")
            .fetch_one(self.pool)
            .await?;
        Ok(row.0)
    }
}
