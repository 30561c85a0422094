//! Short/margin ratio resolver
//!
//! Per market, a [`FallbackChain`] of margin sources is tried in priority
//! order; the first source with at least one OK row wins. Every row is tagged
//! with a [`RatioStatus`]; a ratio only exists for OK rows. The resolver never
//! fails: securities nobody reported are `NO_DATA`.

use chrono::NaiveDate;
use std::collections::HashMap;
use tracing::info;

use crate::schema::{ColumnMap, RawTable};
use crate::sources::FallbackChain;
use crate::types::{MarginRow, Market, RatioStatus, SecurityKey};
use crate::universe::normalize_symbol;

/// Logical columns of a margin-balance table. Flow fields are listed in the
/// order the official tables print them so repeated bare headers
/// ("買進", "今日餘額", ...) are claimed margin side first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarginField {
    Symbol,
    MarginBuy,
    MarginSell,
    MarginRepay,
    MarginPrev,
    MarginBalance,
    ShortBuy,
    ShortSell,
    ShortRepay,
    ShortPrev,
    ShortBalance,
}

/// Convert a resolved margin table into rows. When today's short balance is
/// missing it is derived as `prev + sold − bought − repaid`, missing flow
/// terms counting as 0; without a previous balance it stays missing.
pub fn margin_rows(table: &RawTable, cols: &ColumnMap<MarginField>, market: Market) -> Vec<MarginRow> {
    table
        .rows
        .iter()
        .filter_map(|row| {
            let symbol = cols.cell(row, MarginField::Symbol).and_then(normalize_symbol)?;
            let margin_balance = cols.number(row, MarginField::MarginBalance);
            let short_balance = cols.number(row, MarginField::ShortBalance).or_else(|| {
                let prev = cols.number(row, MarginField::ShortPrev)?;
                let sold = cols.number(row, MarginField::ShortSell).unwrap_or(0.0);
                let bought = cols.number(row, MarginField::ShortBuy).unwrap_or(0.0);
                let repaid = cols.number(row, MarginField::ShortRepay).unwrap_or(0.0);
                Some(prev + sold - bought - repaid)
            });
            Some(MarginRow {
                symbol,
                market,
                margin_balance,
                short_balance,
            })
        })
        .collect()
}

/// Status and (for OK rows) ratio = short / margin × 100
pub fn tag_row(row: &MarginRow) -> (RatioStatus, Option<f64>) {
    match (row.margin_balance, row.short_balance) {
        (Some(m), Some(s)) if m < 0.0 || s < 0.0 => (RatioStatus::Na, None),
        (Some(m), Some(_)) if m == 0.0 => (RatioStatus::Div0, None),
        (Some(m), Some(s)) => (RatioStatus::Ok, Some(s / m * 100.0)),
        _ => (RatioStatus::Na, None),
    }
}

fn has_ok_row(rows: &[MarginRow]) -> bool {
    rows.iter().any(|r| tag_row(r).0.is_ok())
}

/// Ratios and statuses for one run
#[derive(Debug, Clone, Default)]
pub struct RatioResolution {
    ratios: HashMap<SecurityKey, f64>,
    statuses: HashMap<SecurityKey, RatioStatus>,
    /// Winning source per market, `None` when the whole chain failed
    pub sources: HashMap<Market, Option<String>>,
}

impl RatioResolution {
    pub fn ratio(&self, key: &SecurityKey) -> Option<f64> {
        self.ratios.get(key).copied()
    }

    pub fn status(&self, key: &SecurityKey) -> RatioStatus {
        self.statuses.get(key).copied().unwrap_or(RatioStatus::NoData)
    }

    pub fn ratios(&self) -> &HashMap<SecurityKey, f64> {
        &self.ratios
    }

    pub fn count(&self, status: RatioStatus) -> usize {
        self.statuses.values().filter(|s| **s == status).count()
    }

    /// Add rows from one source. A later OK row replaces an earlier non-OK
    /// row for the same key; otherwise the first row wins.
    pub fn absorb(&mut self, rows: &[MarginRow]) {
        for row in rows {
            let key = SecurityKey::new(row.symbol.clone(), row.market);
            let (status, ratio) = tag_row(row);
            let replace = match self.statuses.get(&key) {
                None => true,
                Some(existing) => !existing.is_ok() && status.is_ok(),
            };
            if !replace {
                continue;
            }
            self.statuses.insert(key.clone(), status);
            match ratio {
                Some(r) => {
                    self.ratios.insert(key, r);
                }
                None => {
                    self.ratios.remove(&key);
                }
            }
        }
    }
}

/// Run both market chains and merge the results
pub async fn resolve_ratios(
    primary: &FallbackChain<Vec<MarginRow>>,
    secondary: &FallbackChain<Vec<MarginRow>>,
    target: NaiveDate,
) -> RatioResolution {
    let mut resolution = RatioResolution::default();

    for (market, chain) in [(Market::Primary, primary), (Market::Secondary, secondary)] {
        let outcome = chain.resolve(target, |rows| has_ok_row(rows)).await;
        if let Some(rows) = &outcome.data {
            resolution.absorb(rows);
        }
        resolution.sources.insert(market, outcome.source);
    }

    info!(
        ok = resolution.count(RatioStatus::Ok),
        div0 = resolution.count(RatioStatus::Div0),
        na = resolution.count(RatioStatus::Na),
        "Short/margin ratios resolved"
    );
    resolution
}
