//! Run outputs: ranked CSV, top-N CSV, weight trace JSON, invalid tickers
//!
//! Every exported cell is filled: numbers default to 0, strings to `N/A`,
//! statuses are written as their codes.

use chrono::NaiveDate;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::EngineResult;
use crate::types::{RatioStatus, Regime, SecurityRecord};
use crate::weights::{WeightMode, WeightOutcome, WeightTrace};

const NA: &str = "N/A";

// ============================================================================
// Ratio display
// ============================================================================

/// OK → two decimals, DIV0 → `∞`, otherwise `N/A`
pub fn ratio_display(status: RatioStatus, ratio: Option<f64>) -> String {
    match (status, ratio) {
        (RatioStatus::Ok, Some(r)) => format!("{:.2}", r),
        (RatioStatus::Div0, _) => "∞".to_string(),
        _ => NA.to_string(),
    }
}

pub fn ratio_label(status: RatioStatus, ratio: Option<f64>) -> &'static str {
    match (status, ratio) {
        (RatioStatus::Div0, _) => "blocked(div0)",
        (RatioStatus::Ok, Some(r)) if r >= 50.0 => "blocked(>=50)",
        (RatioStatus::Ok, Some(r)) if r >= 30.0 => "high(>=30)",
        (RatioStatus::Ok, Some(r)) if r < 10.0 => "low(<10)",
        (RatioStatus::Ok, Some(_)) => "normal",
        _ => NA,
    }
}

fn num(v: Option<f64>) -> f64 {
    v.filter(|x| x.is_finite()).unwrap_or(0.0)
}

fn round_to(v: f64, dp: i32) -> f64 {
    let f = 10f64.powi(dp);
    (v * f).round() / f
}

// ============================================================================
// Row shapes
// ============================================================================

#[derive(Debug, Serialize)]
pub struct RankedRow {
    pub rank: usize,
    pub symbol: String,
    pub market: &'static str,
    pub ticker: String,
    pub name: String,
    pub strategy: &'static str,
    pub close: f64,
    pub ma20: f64,
    pub bias_pct: f64,
    pub support: f64,
    pub atr20: f64,
    pub vol_ratio: f64,
    pub volume_ratio: f64,
    pub annual_vol: f64,
    pub short_margin_ratio: String,
    pub ratio_status: &'static str,
    pub ratio_label: &'static str,
    pub squeeze_pressure: f64,
    pub turnover_pct: f64,
    pub traded_value: f64,
    pub traded_value_rank: u32,
    pub strategy_weight: f64,
    pub strategy_score: f64,
    pub liquidity_penalty: f64,
    pub composite_score: f64,
    pub target_position: String,
    pub position_size: String,
    pub stop_loss: f64,
    pub risk_note: String,
}

impl RankedRow {
    pub fn from_record(rank: usize, r: &SecurityRecord) -> Self {
        let ind = &r.indicators;
        Self {
            rank,
            symbol: r.key.symbol.clone(),
            market: r.key.market.label(),
            ticker: r.key.ticker(),
            name: r.name.clone().unwrap_or_else(|| NA.to_string()),
            strategy: r.strategy.label(),
            close: ind.close,
            ma20: round_to(ind.ma20, 2),
            bias_pct: round_to(ind.bias_pct, 2),
            support: ind.support,
            atr20: round_to(ind.atr20, 4),
            vol_ratio: round_to(ind.vol_ratio, 4),
            volume_ratio: round_to(ind.volume_ratio, 4),
            annual_vol: round_to(num(ind.annual_vol), 4),
            short_margin_ratio: ratio_display(r.ratio_status, r.ratio),
            ratio_status: r.ratio_status.label(),
            ratio_label: ratio_label(r.ratio_status, r.ratio),
            squeeze_pressure: round_to(r.squeeze_pressure, 4),
            turnover_pct: round_to(num(r.turnover_pct), 4),
            traded_value: num(r.traded_value).round(),
            traded_value_rank: r.traded_value_rank.unwrap_or(0),
            strategy_weight: round_to(r.strategy_weight, 6),
            strategy_score: round_to(r.strategy_score, 6),
            liquidity_penalty: round_to(r.liquidity_penalty, 2),
            composite_score: round_to(r.composite_score, 6),
            target_position: r.target_position.to_string(),
            position_size: r.position_size.to_string(),
            stop_loss: round_to(r.stop_loss, 2),
            risk_note: if r.annotations.is_empty() { NA.to_string() } else { r.risk_note() },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TopRow {
    pub entry_date: String,
    pub ticker: String,
    pub name: String,
    pub strategy: String,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub squeeze_pressure: f64,
    pub squeeze_pressure_light: &'static str,
    pub bias_pct: f64,
    pub turnover_pct: f64,
    pub turnover_light: &'static str,
    pub traded_value: f64,
    pub traded_value_rank: String,
    pub traded_value_light: &'static str,
    pub position_size: String,
    pub risk_note: String,
    pub composite_score: f64,
}

impl TopRow {
    pub fn from_record(date: NaiveDate, r: &SecurityRecord) -> Self {
        Self {
            entry_date: date.format("%Y-%m-%d").to_string(),
            ticker: r.key.ticker(),
            name: r.name.clone().unwrap_or_else(|| NA.to_string()),
            strategy: r.strategy.description().to_string(),
            entry_price: r.entry_price(),
            stop_loss: round_to(r.stop_loss, 2),
            squeeze_pressure: round_to(r.squeeze_pressure, 2),
            squeeze_pressure_light: r.lights.squeeze_pressure.symbol(),
            bias_pct: round_to(r.indicators.bias_pct, 2),
            turnover_pct: round_to(num(r.turnover_pct), 2),
            turnover_light: r.lights.turnover.symbol(),
            traded_value: num(r.traded_value).round(),
            traded_value_rank: r
                .traded_value_rank
                .map(|n| n.to_string())
                .unwrap_or_else(|| NA.to_string()),
            traded_value_light: r.lights.traded_value_rank.symbol(),
            position_size: r.position_size.to_string(),
            risk_note: if r.annotations.is_empty() { NA.to_string() } else { r.risk_note() },
            composite_score: round_to(r.composite_score, 4),
        }
    }
}

#[derive(Debug, Serialize)]
struct WeightTraceFile<'a> {
    date: String,
    regime: Regime,
    mode: WeightMode,
    weights: &'a std::collections::BTreeMap<String, f64>,
    trace: &'a [WeightTrace],
}

// ============================================================================
// Writers
// ============================================================================

pub fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> EngineResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_ranked_csv(path: &Path, records: &[SecurityRecord]) -> EngineResult<()> {
    let rows: Vec<RankedRow> = records
        .iter()
        .enumerate()
        .map(|(i, r)| RankedRow::from_record(i + 1, r))
        .collect();
    write_rows(path, &rows)
}

pub fn write_top_csv(path: &Path, date: NaiveDate, records: &[SecurityRecord], top_n: usize) -> EngineResult<()> {
    let rows: Vec<TopRow> = records
        .iter()
        .take(top_n)
        .map(|r| TopRow::from_record(date, r))
        .collect();
    write_rows(path, &rows)
}

pub fn write_weight_trace(path: &Path, date: NaiveDate, regime: Regime, weights: &WeightOutcome) -> EngineResult<()> {
    let file = WeightTraceFile {
        date: date.format("%Y-%m-%d").to_string(),
        regime,
        mode: weights.mode,
        weights: &weights.weights,
        trace: &weights.trace,
    };
    fs::write(path, serde_json::to_string_pretty(&file)?)?;
    Ok(())
}

pub fn write_invalid_tickers(path: &Path, tickers: &[String]) -> EngineResult<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["ticker"])?;
    for t in tickers {
        writer.write_record([t.as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Paths written by [`write_run_outputs`]
#[derive(Debug, Clone)]
pub struct RunFiles {
    pub ranked: PathBuf,
    pub top: PathBuf,
    pub weight_trace: PathBuf,
    pub invalid_tickers: PathBuf,
}

pub fn write_run_outputs(
    out_dir: &Path,
    date: NaiveDate,
    regime: Regime,
    records: &[SecurityRecord],
    weights: &WeightOutcome,
    invalid_tickers: &[String],
    top_n: usize,
) -> EngineResult<RunFiles> {
    fs::create_dir_all(out_dir)?;
    let stamp = date.format("%Y%m%d");
    let files = RunFiles {
        ranked: out_dir.join(format!("ranked_{}.csv", stamp)),
        top: out_dir.join(format!("top{}_{}.csv", top_n, stamp)),
        weight_trace: out_dir.join(format!("weights_trace_{}.json", stamp)),
        invalid_tickers: out_dir.join("invalid_tickers.csv"),
    };

    write_ranked_csv(&files.ranked, records)?;
    write_top_csv(&files.top, date, records, top_n)?;
    write_weight_trace(&files.weight_trace, date, regime, weights)?;
    write_invalid_tickers(&files.invalid_tickers, invalid_tickers)?;

    info!(
        dir = %out_dir.display(),
        ranked = records.len(),
        top = records.len().min(top_n),
        invalid = invalid_tickers.len(),
        "Run outputs written"
    );
    Ok(files)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{Indicators, Light, Lights, Market, SecurityKey, StrategyLabel};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    pub(crate) fn make_record(symbol: &str, composite: f64, position: Decimal) -> SecurityRecord {
        SecurityRecord {
            key: SecurityKey::new(symbol, Market::Primary),
            name: None,
            indicators: Indicators {
                close: 100.0,
                ma20: 104.0,
                bias_pct: -3.85,
                support: 95.0,
                atr20: 2.5,
                vol_ratio: 0.8,
                volume_ratio: 1.3,
                avg_volume20: 2_000_000.0,
                last_volume: 2_500_000.0,
                annual_vol: None,
            },
            ratio: None,
            ratio_status: RatioStatus::NoData,
            squeeze_pressure: 0.8,
            turnover_pct: None,
            traded_value: Some(250_000_000.0),
            traded_value_rank: Some(1),
            strategy: StrategyLabel::MeanRevert,
            strategy_weight: 0.5,
            strategy_score: 0.5,
            composite_score: composite,
            liquidity_penalty: 0.0,
            target_position: position,
            position_size: position,
            stop_loss: 95.0,
            lights: Lights {
                turnover: Light::NotAvailable,
                squeeze_pressure: Light::Yellow,
                traded_value_rank: Light::Green,
            },
            annotations: Vec::new(),
        }
    }

    #[test]
    fn test_ratio_display_and_label() {
        assert_eq!(ratio_display(RatioStatus::Ok, Some(31.256)), "31.26");
        assert_eq!(ratio_display(RatioStatus::Div0, None), "∞");
        assert_eq!(ratio_display(RatioStatus::NoData, None), "N/A");

        assert_eq!(ratio_label(RatioStatus::Div0, None), "blocked(div0)");
        assert_eq!(ratio_label(RatioStatus::Ok, Some(50.0)), "blocked(>=50)");
        assert_eq!(ratio_label(RatioStatus::Ok, Some(30.0)), "high(>=30)");
        assert_eq!(ratio_label(RatioStatus::Ok, Some(9.9)), "low(<10)");
        assert_eq!(ratio_label(RatioStatus::Ok, Some(20.0)), "normal");
        assert_eq!(ratio_label(RatioStatus::Na, None), "N/A");
    }

    #[test]
    fn test_ranked_row_sentinels() {
        let row = RankedRow::from_record(1, &make_record("2330", 0.7, dec!(0)));
        assert_eq!(row.name, "N/A");
        assert_eq!(row.turnover_pct, 0.0);
        assert_eq!(row.annual_vol, 0.0);
        assert_eq!(row.short_margin_ratio, "N/A");
        assert_eq!(row.ratio_status, "NO_DATA");
        assert_eq!(row.risk_note, "N/A");
        assert_eq!(row.ticker, "2330.TW");
    }

    #[test]
    fn test_write_run_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let records: Vec<SecurityRecord> = (0..3)
            .map(|i| make_record(&format!("110{}", i), 1.0 - i as f64 * 0.1, dec!(10000)))
            .collect();
        let weights = WeightOutcome {
            mode: WeightMode::Equal,
            weights: BTreeMap::from([("MEAN_REVERT".to_string(), 1.0)]),
            trace: Vec::new(),
        };
        let date = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();

        let files = write_run_outputs(
            tmp.path(),
            date,
            Regime::Range,
            &records,
            &weights,
            &["9999.TWO".to_string()],
            2,
        )
        .unwrap();

        assert!(files.ranked.ends_with("ranked_20240502.csv"));
        let ranked = std::fs::read_to_string(&files.ranked).unwrap();
        assert_eq!(ranked.lines().count(), 4);
        assert!(ranked.lines().next().unwrap().starts_with("rank,symbol,market"));

        let top = std::fs::read_to_string(&files.top).unwrap();
        assert_eq!(top.lines().count(), 3);
        assert!(top.contains("2024-05-02"));

        let trace: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&files.weight_trace).unwrap()).unwrap();
        assert_eq!(trace["mode"], "EQUAL");
        assert_eq!(trace["regime"], "RANGE");

        let invalid = std::fs::read_to_string(&files.invalid_tickers).unwrap();
        assert_eq!(invalid, "ticker\n9999.TWO\n");
    }
}
