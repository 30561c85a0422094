//! Core types shared across the screener

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ============================================================================
// Identity
// ============================================================================

/// Listing venue. PRIMARY is the main board (TWSE), SECONDARY the OTC board (TPEx).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Market {
    Primary,
    Secondary,
}

impl Market {
    pub fn label(&self) -> &'static str {
        match self {
            Market::Primary => "PRIMARY",
            Market::Secondary => "SECONDARY",
        }
    }

    /// Ticker suffix used by the history provider
    pub fn ticker_suffix(&self) -> &'static str {
        match self {
            Market::Primary => ".TW",
            Market::Secondary => ".TWO",
        }
    }

    /// Map the many spellings upstream tables use onto a market
    pub fn from_alias(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TW" | "TWSE" | "LISTED" | "PRIMARY" | "上市" => Some(Market::Primary),
            "TWO" | "OTC" | "TPEX" | "SECONDARY" | "上櫃" => Some(Market::Secondary),
            _ => None,
        }
    }
}

impl std::fmt::Display for Market {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// (symbol, market) pair identifying one row of a run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecurityKey {
    pub symbol: String,
    pub market: Market,
}

impl SecurityKey {
    pub fn new(symbol: impl Into<String>, market: Market) -> Self {
        Self {
            symbol: symbol.into(),
            market,
        }
    }

    /// Ticker as the history provider expects it, e.g. `2330.TW`
    pub fn ticker(&self) -> String {
        format!("{}{}", self.symbol, self.market.ticker_suffix())
    }
}

impl std::fmt::Display for SecurityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.market, self.symbol)
    }
}

// ============================================================================
// Market data
// ============================================================================

/// One daily OHLCV bar
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Margin/short balances for one security as reported by a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginRow {
    pub symbol: String,
    pub market: Market,
    pub margin_balance: Option<f64>,
    pub short_balance: Option<f64>,
}

/// Quality tag of a short/margin ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RatioStatus {
    Ok,
    /// Zero margin balance with a reported short balance
    Div0,
    /// A balance is missing or negative
    Na,
    /// No source reported the security
    NoData,
}

impl RatioStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RatioStatus::Ok => "OK",
            RatioStatus::Div0 => "DIV0",
            RatioStatus::Na => "NA",
            RatioStatus::NoData => "NO_DATA",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, RatioStatus::Ok)
    }
}

impl std::fmt::Display for RatioStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyLabel {
    SqueezePrimary,
    SqueezeSecondary,
    MeanRevert,
    HighMarginMeanRevert,
}

impl StrategyLabel {
    pub const ALL: [StrategyLabel; 4] = [
        StrategyLabel::SqueezePrimary,
        StrategyLabel::SqueezeSecondary,
        StrategyLabel::MeanRevert,
        StrategyLabel::HighMarginMeanRevert,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            StrategyLabel::SqueezePrimary => "SQUEEZE_PRIMARY",
            StrategyLabel::SqueezeSecondary => "SQUEEZE_SECONDARY",
            StrategyLabel::MeanRevert => "MEAN_REVERT",
            StrategyLabel::HighMarginMeanRevert => "HIGH_MARGIN_MEAN_REVERT",
        }
    }

    pub fn from_label(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL
            .into_iter()
            .find(|s| s.label().eq_ignore_ascii_case(raw))
    }

    /// One-line description for the exported top list
    pub fn description(&self) -> &'static str {
        match self {
            StrategyLabel::SqueezePrimary => {
                "Short squeeze (main board): high short/margin ratio with expanding range and volume"
            }
            StrategyLabel::SqueezeSecondary => {
                "Short squeeze (OTC): range and volume pressure proxy above threshold"
            }
            StrategyLabel::MeanRevert => "Mean reversion: price stretched below MA20, support intact",
            StrategyLabel::HighMarginMeanRevert => {
                "Deep mean reversion: bias below the deep threshold, support intact"
            }
        }
    }
}

impl std::fmt::Display for StrategyLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Market-wide regime, computed once per run from the index history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    Range,
    Trend,
    Stress,
}

impl Regime {
    pub fn label(&self) -> &'static str {
        match self {
            Regime::Range => "RANGE",
            Regime::Trend => "TREND",
            Regime::Stress => "STRESS",
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Traffic light used for display classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Light {
    Green,
    Yellow,
    Red,
    NotAvailable,
}

impl Light {
    pub fn symbol(&self) -> &'static str {
        match self {
            Light::Green => "🟢",
            Light::Yellow => "🟡",
            Light::Red => "🔴",
            Light::NotAvailable => "N/A",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lights {
    pub turnover: Light,
    pub squeeze_pressure: Light,
    pub traded_value_rank: Light,
}

// ============================================================================
// Per-security records
// ============================================================================

/// Dimensionless indicators derived from the trailing history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicators {
    pub close: f64,
    pub ma20: f64,
    pub bias_pct: f64,
    /// 20-bar low
    pub support: f64,
    pub atr20: f64,
    /// 20-bar range / 60-bar range
    pub vol_ratio: f64,
    /// 5-bar mean volume / 20-bar mean volume
    pub volume_ratio: f64,
    pub avg_volume20: f64,
    pub last_volume: f64,
    /// Annualized realized volatility of daily returns
    pub annual_vol: Option<f64>,
}

/// A security that passed indicator normalization, before classification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub key: SecurityKey,
    pub name: Option<String>,
    pub indicators: Indicators,
    pub ratio: Option<f64>,
    pub ratio_status: RatioStatus,
    pub squeeze_pressure: f64,
    pub turnover_pct: Option<f64>,
    pub traded_value: Option<f64>,
}

/// A classified, scored and sized row of the ranked output.
/// Securities with no strategy never become a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRecord {
    pub key: SecurityKey,
    pub name: Option<String>,
    pub indicators: Indicators,
    pub ratio: Option<f64>,
    pub ratio_status: RatioStatus,
    pub squeeze_pressure: f64,
    pub turnover_pct: Option<f64>,
    pub traded_value: Option<f64>,
    pub traded_value_rank: Option<u32>,
    pub strategy: StrategyLabel,
    pub strategy_weight: f64,
    pub strategy_score: f64,
    pub composite_score: f64,
    pub liquidity_penalty: f64,
    /// Size before the liquidity gate and ratio blocks
    pub target_position: Decimal,
    pub position_size: Decimal,
    pub stop_loss: f64,
    pub lights: Lights,
    pub annotations: Vec<String>,
}

impl SecurityRecord {
    pub fn risk_note(&self) -> String {
        self.annotations.join("; ")
    }

    pub fn entry_price(&self) -> f64 {
        self.indicators.close
    }
}
