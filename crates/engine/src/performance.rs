//! Previous-period performance summary
//!
//! Read from `performance_summary.csv` when present; otherwise regenerated
//! from the closed-trade history and written back to the same file.

use chrono::NaiveDate;
use persistence::repository::{ClosedTradeRecord, ClosedTradeRepository};
use persistence::SqlitePool;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::EngineResult;
use crate::schema::{FieldSpec, RawTable, TableSchema};
use crate::types::{Market, StrategyLabel};
use crate::universe::normalize_symbol;
use crate::weights::{PerformanceInput, PerformanceSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryField {
    Strategy,
    Annualized,
    MaxDrawdown,
    Trades,
}

pub const SUMMARY_SCHEMA: TableSchema<SummaryField> = TableSchema {
    name: "performance_summary",
    fields: &[
        FieldSpec {
            field: SummaryField::Strategy,
            aliases: &[&["strategy"], &["策略"]],
            required: true,
        },
        FieldSpec {
            field: SummaryField::Annualized,
            aliases: &[&["annualized_pct"], &["annualized"], &["年化"]],
            required: true,
        },
        FieldSpec {
            field: SummaryField::MaxDrawdown,
            aliases: &[&["max_drawdown_pct"], &["mdd"], &["max_drawdown"], &["最大回撤"]],
            required: true,
        },
        FieldSpec {
            field: SummaryField::Trades,
            aliases: &[&["trades"], &["trade"], &["交易次數"]],
            required: false,
        },
    ],
};

/// Parse a summary table. Rows without a strategy or a finite annualized
/// return and drawdown are skipped.
pub fn parse_summary(text: &str, source: &str) -> EngineResult<PerformanceSummary> {
    let table = RawTable::from_csv_text(text, &SUMMARY_SCHEMA)?;
    let cols = table.columns(&SUMMARY_SCHEMA)?;
    let rows = table
        .rows
        .iter()
        .filter_map(|row| {
            Some(PerformanceInput {
                strategy: cols.cell(row, SummaryField::Strategy)?.to_string(),
                annualized_pct: cols.number(row, SummaryField::Annualized)?,
                max_drawdown_pct: cols.number(row, SummaryField::MaxDrawdown)?,
                trades: cols
                    .number(row, SummaryField::Trades)
                    .filter(|t| *t >= 0.0)
                    .map(|t| t.round() as u32),
            })
        })
        .collect();
    Ok(PerformanceSummary {
        source: source.to_string(),
        rows,
    })
}

/// `Ok(None)` when the file does not exist
pub fn load_summary(path: &Path) -> EngineResult<Option<PerformanceSummary>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)?;
    let summary = parse_summary(&text, &path.display().to_string())?;
    Ok(Some(summary))
}

pub fn write_summary(path: &Path, summary: &PerformanceSummary) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["strategy", "annualized_pct", "max_drawdown_pct", "trades"])?;
    for row in &summary.rows {
        writer.write_record([
            row.strategy.clone(),
            format!("{:.4}", row.annualized_pct),
            format!("{:.4}", row.max_drawdown_pct),
            row.trades.map(|t| t.to_string()).unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

// ============================================================================
// Closed-trade import
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeField {
    Symbol,
    Market,
    Strategy,
    EntryDate,
    ExitDate,
    EntryPrice,
    ExitPrice,
}

pub const TRADE_SCHEMA: TableSchema<TradeField> = TableSchema {
    name: "closed_trades",
    fields: &[
        FieldSpec {
            field: TradeField::Symbol,
            aliases: &[&["symbol"], &["ticker"], &["代號"]],
            required: true,
        },
        FieldSpec {
            field: TradeField::Market,
            aliases: &[&["market"], &["市場"]],
            required: false,
        },
        FieldSpec {
            field: TradeField::Strategy,
            aliases: &[&["strategy"], &["策略"]],
            required: true,
        },
        FieldSpec {
            field: TradeField::EntryDate,
            aliases: &[&["entry_date"], &["entry", "date"], &["進場日"]],
            required: true,
        },
        FieldSpec {
            field: TradeField::ExitDate,
            aliases: &[&["exit_date"], &["exit", "date"], &["出場日"]],
            required: true,
        },
        FieldSpec {
            field: TradeField::EntryPrice,
            aliases: &[&["entry_price"], &["entry", "price"], &["進場價"]],
            required: true,
        },
        FieldSpec {
            field: TradeField::ExitPrice,
            aliases: &[&["exit_price"], &["exit", "price"], &["出場價"]],
            required: true,
        },
    ],
};

/// Parse a closed-trade table. Rows with an unparseable date, a
/// non-positive entry price or an unknown strategy are skipped.
pub fn parse_closed_trades(text: &str) -> EngineResult<Vec<ClosedTradeRecord>> {
    let table = RawTable::from_csv_text(text, &TRADE_SCHEMA)?;
    let cols = table.columns(&TRADE_SCHEMA)?;
    let trades = table
        .rows
        .iter()
        .filter_map(|row| {
            let symbol = normalize_symbol(cols.cell(row, TradeField::Symbol)?)?;
            let market = cols
                .cell(row, TradeField::Market)
                .and_then(Market::from_alias)
                .unwrap_or(Market::Primary);
            let strategy = StrategyLabel::from_label(cols.cell(row, TradeField::Strategy)?)?;
            let entry_date = parse_date(cols.cell(row, TradeField::EntryDate)?)?;
            let exit_date = parse_date(cols.cell(row, TradeField::ExitDate)?)?;
            let entry_price = cols.number(row, TradeField::EntryPrice).filter(|p| *p > 0.0)?;
            let exit_price = cols.number(row, TradeField::ExitPrice)?;
            Some(ClosedTradeRecord::new(
                &symbol,
                market.label(),
                strategy.label(),
                &entry_date.to_string(),
                &exit_date.to_string(),
                entry_price,
                exit_price,
            ))
        })
        .collect();
    Ok(trades)
}

/// Load a closed-trade CSV into the store. Returns (parsed, newly inserted).
pub async fn import_closed_trades(pool: &SqlitePool, path: &Path) -> EngineResult<(usize, usize)> {
    let text = std::fs::read_to_string(path)?;
    let trades = parse_closed_trades(&text)?;
    let repo = ClosedTradeRepository::new(pool);
    let mut inserted = 0;
    for trade in &trades {
        if repo.insert(trade).await? {
            inserted += 1;
        }
    }
    info!(path = %path.display(), parsed = trades.len(), inserted, "Closed trades imported");
    Ok((trades.len(), inserted))
}

// ============================================================================
// Regeneration from closed trades
// ============================================================================

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

/// Per strategy: compound `pnl_pct` in exit order, annualize over the span
/// from first entry to last exit (at least one day), and take the worst
/// peak-to-trough of the equity curve as drawdown (≤ 0).
pub fn summarize_trades(trades: &[ClosedTradeRecord]) -> Option<PerformanceSummary> {
    let mut by_strategy: BTreeMap<&str, Vec<&ClosedTradeRecord>> = BTreeMap::new();
    for t in trades {
        by_strategy.entry(t.strategy.as_str()).or_default().push(t);
    }

    let rows: Vec<PerformanceInput> = by_strategy
        .into_iter()
        .filter_map(|(strategy, mut group)| {
            group.sort_by(|a, b| a.exit_date.cmp(&b.exit_date));
            let first_entry = group.iter().filter_map(|t| parse_date(&t.entry_date)).min()?;
            let last_exit = group.iter().filter_map(|t| parse_date(&t.exit_date)).max()?;
            let span_days = (last_exit - first_entry).num_days().max(1) as f64;

            let mut equity = 1.0_f64;
            let mut peak = 1.0_f64;
            let mut mdd = 0.0_f64;
            for t in &group {
                equity *= 1.0 + t.pnl_pct / 100.0;
                peak = peak.max(equity);
                if peak > 0.0 {
                    mdd = mdd.min((equity - peak) / peak * 100.0);
                }
            }

            let annualized = if equity > 0.0 {
                (equity.powf(365.0 / span_days) - 1.0) * 100.0
            } else {
                -100.0
            };
            Some(PerformanceInput {
                strategy: strategy.to_string(),
                annualized_pct: if annualized.is_finite() { annualized } else { 0.0 },
                max_drawdown_pct: mdd,
                trades: Some(group.len() as u32),
            })
        })
        .collect();

    if rows.is_empty() {
        return None;
    }
    Some(PerformanceSummary {
        source: "closed_trades".to_string(),
        rows,
    })
}

/// Summary file first, then regeneration. Never fails: problems are logged
/// and mean "no performance data".
pub async fn resolve_performance(
    summary_path: &Path,
    pool: Option<&SqlitePool>,
) -> Option<PerformanceSummary> {
    match load_summary(summary_path) {
        Ok(Some(summary)) if !summary.rows.is_empty() => {
            info!(path = %summary_path.display(), strategies = summary.rows.len(), "Loaded performance summary");
            return Some(summary);
        }
        Ok(_) => info!(path = %summary_path.display(), "No performance summary, regenerating from closed trades"),
        Err(e) => warn!(path = %summary_path.display(), error = %e, "Unreadable performance summary, regenerating"),
    }

    let pool = pool?;
    let trades = match ClosedTradeRepository::new(pool).get_all().await {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "Failed to read closed trades");
            return None;
        }
    };
    let summary = summarize_trades(&trades)?;
    if let Err(e) = write_summary(summary_path, &summary) {
        warn!(path = %summary_path.display(), error = %e, "Failed to write regenerated summary");
    }
    info!(strategies = summary.rows.len(), trades = trades.len(), "Regenerated performance summary");
    Some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(strategy: &str, entry: &str, exit: &str, pnl_pct: f64) -> ClosedTradeRecord {
        let entry_price = 100.0;
        let exit_price = entry_price * (1.0 + pnl_pct / 100.0);
        ClosedTradeRecord::new("2330", "PRIMARY", strategy, entry, exit, entry_price, exit_price)
    }

    #[test]
    fn test_parse_summary_with_aliased_headers() {
        let text = "Strategy,Annualized Return %,MDD %,Trades\n\
                    MEAN_REVERT,25.5,-12.0,42\n\
                    SQUEEZE_PRIMARY,n/a,-3.0,5\n";
        let summary = parse_summary(text, "test.csv").unwrap();
        assert_eq!(summary.rows.len(), 1);
        assert_eq!(summary.rows[0].strategy, "MEAN_REVERT");
        assert_eq!(summary.rows[0].trades, Some(42));
        assert!((summary.rows[0].max_drawdown_pct + 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_summarize_trades_drawdown_and_count() {
        let trades = vec![
            trade("MEAN_REVERT", "2024-01-01", "2024-01-10", 10.0),
            trade("MEAN_REVERT", "2024-01-11", "2024-01-20", -20.0),
            trade("MEAN_REVERT", "2024-01-21", "2024-01-31", 5.0),
            trade("SQUEEZE_PRIMARY", "2024-02-01", "2024-02-05", 3.0),
        ];
        let summary = summarize_trades(&trades).unwrap();
        assert_eq!(summary.rows.len(), 2);

        let mr = &summary.rows[0];
        assert_eq!(mr.strategy, "MEAN_REVERT");
        assert_eq!(mr.trades, Some(3));
        // peak 1.10 then 0.88
        assert!((mr.max_drawdown_pct + 20.0).abs() < 1e-6, "mdd {}", mr.max_drawdown_pct);
        // 1.1 * 0.8 * 1.05 = 0.924 over 30 days → strongly negative annualized
        assert!(mr.annualized_pct < -50.0);

        let sq = &summary.rows[1];
        assert_eq!(sq.max_drawdown_pct, 0.0);
        assert!(sq.annualized_pct > 0.0);
    }

    #[test]
    fn test_summarize_no_trades() {
        assert!(summarize_trades(&[]).is_none());
    }

    #[test]
    fn test_write_then_load_summary() {
        let dir = std::env::temp_dir().join(format!("screener-perf-{}", std::process::id()));
        let path = dir.join("performance_summary.csv");
        let summary = PerformanceSummary {
            source: "x".into(),
            rows: vec![PerformanceInput {
                strategy: "MEAN_REVERT".into(),
                annualized_pct: 12.5,
                max_drawdown_pct: -4.0,
                trades: Some(21),
            }],
        };
        write_summary(&path, &summary).unwrap();
        let loaded = load_summary(&path).unwrap().unwrap();
        assert_eq!(loaded.rows, summary.rows);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_parse_closed_trades_skips_bad_rows() {
        let text = "Symbol,Market,Strategy,Entry Date,Exit Date,Entry Price,Exit Price\n\
                    2330.TW,TWSE,MEAN_REVERT,2024-03-01,2024-03-08,100,110\n\
                    6488,OTC,squeeze_secondary,2024-03-04,2024-03-06,50,45\n\
                    2317,TWSE,UNKNOWN,2024-03-01,2024-03-02,100,101\n\
                    1101,TWSE,MEAN_REVERT,2024-03-01,2024-03-02,0,101\n";
        let trades = parse_closed_trades(text).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].symbol, "2330");
        assert_eq!(trades[0].market, "PRIMARY");
        assert!((trades[0].pnl_pct - 10.0).abs() < 1e-9);
        assert_eq!(trades[1].market, "SECONDARY");
        assert_eq!(trades[1].strategy, "SQUEEZE_SECONDARY");
    }

    #[tokio::test]
    async fn test_import_closed_trades_dedupes() {
        let db = persistence::Database::in_memory().await.unwrap();
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("closed.csv");
        std::fs::write(
            &path,
            "symbol,strategy,entry_date,exit_date,entry_price,exit_price\n\
             2330,MEAN_REVERT,2024-03-01,2024-03-08,100,110\n",
        )
        .unwrap();

        assert_eq!(import_closed_trades(db.pool(), &path).await.unwrap(), (1, 1));
        assert_eq!(import_closed_trades(db.pool(), &path).await.unwrap(), (1, 0));

        let summary = resolve_performance(&tmp.path().join("summary.csv"), Some(db.pool()))
            .await
            .unwrap();
        assert_eq!(summary.rows[0].strategy, "MEAN_REVERT");
        assert!(tmp.path().join("summary.csv").exists());
    }
}
