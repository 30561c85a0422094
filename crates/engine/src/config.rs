//! Screener configuration
//!
//! Every threshold of the daily run lives here with its production default.
//! A JSON file may override any subset of fields; a handful of environment
//! variables override the file.
//!
//! | Env Var                    | Config Field                          |
//! |----------------------------|---------------------------------------|
//! | `TURNOVER_PRICE_SPLIT`     | `liquidity.price_split`               |
//! | `TURNOVER_BLOCK_PCT_LOW`   | `liquidity.turnover_block_pct_low`    |
//! | `TURNOVER_BLOCK_PCT_HIGH`  | `liquidity.turnover_block_pct_high`   |
//! | `AMOUNT_BLOCK_NTD_LOW`     | `liquidity.amount_block_low`          |
//! | `AMOUNT_BLOCK_NTD_HIGH`    | `liquidity.amount_block_high`         |
//! | `VOL_TARGET_ANNUAL`        | `liquidity.vol_target_annual`         |
//! | `VOL_LOOKBACK`             | `indicators.vol_lookback`             |
//! | `TWSE_SSL_VERIFY`          | `fetch.ssl_verify`                    |
//! | `SCREENER_TOTAL_CAPITAL`   | `capital.total_capital`               |

use crate::error::{EngineError, EngineResult};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenerConfig {
    pub capital: CapitalConfig,
    pub indicators: IndicatorConfig,
    pub classifier: ClassifierConfig,
    pub regime: RegimeConfig,
    pub weights: WeightConfig,
    pub ratio: RatioConfig,
    pub liquidity: LiquidityConfig,
    pub scoring: ScoringConfig,
    pub fetch: FetchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapitalConfig {
    pub total_capital: Decimal,
    pub max_account_risk: f64,
    pub per_trade_risk_ratio: f64,
    /// Hard ceiling of a single position as a share of capital
    pub max_position_share: f64,
    /// Positions above this share of capital get a HIGH RISK note
    pub high_risk_share: f64,
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            total_capital: dec!(300000),
            max_account_risk: 0.10,
            per_trade_risk_ratio: 0.20,
            max_position_share: 0.50,
            high_risk_share: 0.20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    pub min_bars: usize,
    /// Floor on the 20-bar mean volume, in shares
    pub min_avg_volume: f64,
    /// Returns used for realized volatility
    pub vol_lookback: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            min_bars: 60,
            min_avg_volume: 100_000.0,
            vol_lookback: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub bias_mean_revert: f64,
    pub bias_deep: f64,
    pub squeeze_ratio: f64,
    pub squeeze_pressure: f64,
    pub squeeze_vol_ratio: f64,
    pub squeeze_volume_ratio: f64,
    pub squeeze_min_bias: f64,
    pub support_tolerance: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            bias_mean_revert: -6.0,
            bias_deep: -8.0,
            squeeze_ratio: 30.0,
            squeeze_pressure: 0.90,
            squeeze_vol_ratio: 0.70,
            squeeze_volume_ratio: 1.20,
            squeeze_min_bias: -3.0,
            support_tolerance: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub index_ticker: String,
    pub range_multiplier: f64,
    pub trend_multiplier: f64,
    pub stress_multiplier: f64,
    pub stress_vol_ratio: f64,
    pub stress_abs_bias: f64,
    pub trend_deviation: f64,
    pub trend_vol_ratio: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            index_ticker: "0050.TW".to_string(),
            range_multiplier: 1.0,
            trend_multiplier: 1.2,
            stress_multiplier: 0.5,
            stress_vol_ratio: 0.9,
            stress_abs_bias: 6.0,
            trend_deviation: 0.03,
            trend_vol_ratio: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightConfig {
    pub smoothing_enabled: bool,
    pub alpha: f64,
    pub min_trades: u32,
    pub max_strategy_weight: f64,
    pub epsilon: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            smoothing_enabled: true,
            alpha: 0.30,
            min_trades: 20,
            max_strategy_weight: 0.50,
            epsilon: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RatioConfig {
    /// Calendar days the dated sources walk back
    pub lookback_days: u32,
    /// Attempts against the "latest" endpoints
    pub latest_attempts: u32,
    /// Ratio at or above which the position is blocked
    pub block_ratio: f64,
    /// Ratio at or above which the strategy score is penalized
    pub penalty_ratio: f64,
    pub penalty: f64,
}

impl Default for RatioConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            latest_attempts: 3,
            block_ratio: 50.0,
            penalty_ratio: 30.0,
            penalty: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidityConfig {
    pub price_split: f64,
    /// Turnover % floor below the price split
    pub turnover_block_pct_low: f64,
    /// Turnover % floor at or above the price split
    pub turnover_block_pct_high: f64,
    pub amount_block_low: f64,
    pub amount_block_high: f64,
    pub vol_target_annual: f64,
}

impl Default for LiquidityConfig {
    fn default() -> Self {
        Self {
            price_split: 200.0,
            turnover_block_pct_low: 0.20,
            turnover_block_pct_high: 0.10,
            amount_block_low: 3_000_000.0,
            amount_block_high: 6_000_000.0,
            vol_target_annual: 0.35,
        }
    }
}

/// Traded-value floor applying to prices below `below_price`
/// (`None` = every price not caught by an earlier band)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmountBand {
    pub below_price: Option<f64>,
    pub floor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weight_position: f64,
    pub weight_strategy: f64,
    pub weight_bias: f64,
    pub weight_turnover: f64,
    pub weight_traded_value: f64,
    pub penalty_low_value: f64,
    pub penalty_high_vol: f64,
    pub high_vol_threshold: f64,
    pub amount_bands: Vec<AmountBand>,
    /// Turnover % lights: green at or above, yellow at or above
    pub turnover_green: f64,
    pub turnover_yellow: f64,
    /// Squeeze pressure lights: red at or above, yellow at or above
    pub pressure_red: f64,
    pub pressure_yellow: f64,
    /// Traded-value rank lights: green at or below, yellow at or below
    pub value_rank_green: u32,
    pub value_rank_yellow: u32,
    pub top_n: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weight_position: 0.25,
            weight_strategy: 0.25,
            weight_bias: 0.20,
            weight_turnover: 0.10,
            weight_traded_value: 0.20,
            penalty_low_value: 0.30,
            penalty_high_vol: 0.30,
            high_vol_threshold: 0.50,
            amount_bands: vec![
                AmountBand { below_price: Some(20.0), floor: 3_000_000.0 },
                AmountBand { below_price: Some(50.0), floor: 5_000_000.0 },
                AmountBand { below_price: Some(100.0), floor: 8_000_000.0 },
                AmountBand { below_price: Some(200.0), floor: 12_000_000.0 },
                AmountBand { below_price: None, floor: 18_000_000.0 },
            ],
            turnover_green: 1.00,
            turnover_yellow: 0.30,
            pressure_red: 0.90,
            pressure_yellow: 0.70,
            value_rank_green: 200,
            value_rank_yellow: 600,
            top_n: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub batch_size: usize,
    pub batch_sleep_ms: u64,
    pub max_retries: u32,
    pub backoff_base_secs: f64,
    pub request_timeout_secs: u64,
    pub history_cache_ttl_hours: i64,
    pub shares_cache_ttl_hours: i64,
    pub two_stage: bool,
    pub prefilter_top_n: usize,
    pub ssl_verify: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            batch_size: 60,
            batch_sleep_ms: 800,
            max_retries: 4,
            backoff_base_secs: 3.0,
            request_timeout_secs: 25,
            history_cache_ttl_hours: 48,
            shares_cache_ttl_hours: 72,
            two_stage: true,
            prefilter_top_n: 1200,
            ssl_verify: true,
        }
    }
}

impl ScreenerConfig {
    /// Load from an optional JSON file, apply env overrides, validate
    pub fn load(path: Option<&Path>) -> EngineResult<Self> {
        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| {
                    EngineError::Config(format!("failed to read {}: {}", p.display(), e))
                })?;
                serde_json::from_str(&text)
                    .map_err(|e| EngineError::Config(format!("parsing {}: {}", p.display(), e)))?
            }
            None => ScreenerConfig::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup. Empty or unparseable values are skipped.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parse_f64 = |key: &str| -> Option<f64> {
            let raw = get(key)?;
            match raw.trim().parse::<f64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "Ignoring unparseable env override");
                    None
                }
            }
        };

        if let Some(val) = parse_f64("TURNOVER_PRICE_SPLIT") {
            info!(val, "env override: TURNOVER_PRICE_SPLIT");
            self.liquidity.price_split = val;
        }
        if let Some(val) = parse_f64("TURNOVER_BLOCK_PCT_LOW") {
            info!(val, "env override: TURNOVER_BLOCK_PCT_LOW");
            self.liquidity.turnover_block_pct_low = val;
        }
        if let Some(val) = parse_f64("TURNOVER_BLOCK_PCT_HIGH") {
            info!(val, "env override: TURNOVER_BLOCK_PCT_HIGH");
            self.liquidity.turnover_block_pct_high = val;
        }
        if let Some(val) = parse_f64("AMOUNT_BLOCK_NTD_LOW") {
            info!(val, "env override: AMOUNT_BLOCK_NTD_LOW");
            self.liquidity.amount_block_low = val;
        }
        if let Some(val) = parse_f64("AMOUNT_BLOCK_NTD_HIGH") {
            info!(val, "env override: AMOUNT_BLOCK_NTD_HIGH");
            self.liquidity.amount_block_high = val;
        }
        if let Some(val) = parse_f64("VOL_TARGET_ANNUAL") {
            info!(val, "env override: VOL_TARGET_ANNUAL");
            self.liquidity.vol_target_annual = val;
        }
        if let Some(val) = parse_f64("VOL_LOOKBACK") {
            if val >= 2.0 {
                info!(val, "env override: VOL_LOOKBACK");
                self.indicators.vol_lookback = val as usize;
            }
        }
        if let Some(raw) = get("TWSE_SSL_VERIFY") {
            let val = !matches!(raw.trim().to_lowercase().as_str(), "0" | "false" | "no");
            info!(val, "env override: TWSE_SSL_VERIFY");
            self.fetch.ssl_verify = val;
        }
        if let Some(raw) = get("SCREENER_TOTAL_CAPITAL") {
            match Decimal::from_str(raw.trim()) {
                Ok(val) => {
                    info!(%val, "env override: SCREENER_TOTAL_CAPITAL");
                    self.capital.total_capital = val;
                }
                Err(_) => warn!(value = %raw, "Ignoring unparseable SCREENER_TOTAL_CAPITAL"),
            }
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        let fail = |msg: &str| Err(EngineError::Config(msg.to_string()));

        if self.capital.total_capital <= Decimal::ZERO {
            return fail("capital.total_capital must be positive");
        }
        if !(0.0..=1.0).contains(&self.weights.alpha) {
            return fail("weights.alpha must be within [0, 1]");
        }
        if !(self.weights.max_strategy_weight > 0.0 && self.weights.max_strategy_weight <= 1.0) {
            return fail("weights.max_strategy_weight must be within (0, 1]");
        }
        if self.weights.epsilon <= 0.0 {
            return fail("weights.epsilon must be positive");
        }
        if self.scoring.turnover_green < self.scoring.turnover_yellow {
            return fail("scoring.turnover_green must not be below turnover_yellow");
        }
        if self.scoring.pressure_red < self.scoring.pressure_yellow {
            return fail("scoring.pressure_red must not be below pressure_yellow");
        }
        if self.scoring.value_rank_green > self.scoring.value_rank_yellow {
            return fail("scoring.value_rank_green must not exceed value_rank_yellow");
        }
        if self.scoring.amount_bands.is_empty() {
            return fail("scoring.amount_bands must not be empty");
        }
        if self.indicators.min_bars < 60 {
            return fail("indicators.min_bars must be at least 60");
        }
        if self.fetch.batch_size == 0 {
            return fail("fetch.batch_size must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = ScreenerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.capital.total_capital, dec!(300000));
        assert_eq!(config.scoring.amount_bands.len(), 5);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ScreenerConfig =
            serde_json::from_str(r#"{ "weights": { "alpha": 0.5 } }"#).unwrap();
        assert_eq!(config.weights.alpha, 0.5);
        assert_eq!(config.weights.min_trades, 20);
        assert_eq!(config.liquidity.price_split, 200.0);
    }

    #[test]
    fn test_overrides_apply_and_skip_garbage() {
        let env: HashMap<&str, &str> = [
            ("TURNOVER_PRICE_SPLIT", "150"),
            ("VOL_TARGET_ANNUAL", "abc"),
            ("TWSE_SSL_VERIFY", "0"),
            ("SCREENER_TOTAL_CAPITAL", "500000"),
        ]
        .into_iter()
        .collect();

        let mut config = ScreenerConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.liquidity.price_split, 150.0);
        assert_eq!(config.liquidity.vol_target_annual, 0.35);
        assert!(!config.fetch.ssl_verify);
        assert_eq!(config.capital.total_capital, dec!(500000));
    }

    #[test]
    fn test_validate_rejects_bad_alpha() {
        let mut config = ScreenerConfig::default();
        config.weights.alpha = 1.5;
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }
}
