//! Market regime, position sizing and the liquidity gate

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::config::{CapitalConfig, LiquidityConfig, RegimeConfig};
use crate::indicators::{last_range, last_sma};
use crate::types::{Bar, Regime};

// ============================================================================
// Regime
// ============================================================================

/// Classify the index history. Fewer than 60 bars is RANGE.
pub fn classify_regime(bars: &[Bar], config: &RegimeConfig) -> Regime {
    if bars.len() < 60 {
        return Regime::Range;
    }
    let Some(close) = bars.last().map(|b| b.close) else {
        return Regime::Range;
    };
    let closes = || bars.iter().map(|b| b.close);
    let (Some(ma20), Some(ma60), Some(range20), Some(range60)) = (
        last_sma(closes(), 20),
        last_sma(closes(), 60),
        last_range(bars, 20),
        last_range(bars, 60),
    ) else {
        return Regime::Range;
    };
    if ma20 <= 0.0 || ma60 <= 0.0 || range60 <= 0.0 {
        return Regime::Range;
    }

    let trend = (close - ma60).abs() / ma60;
    let vol_ratio = range20 / range60;
    let bias = (close - ma20) / ma20 * 100.0;

    if vol_ratio >= config.stress_vol_ratio && bias.abs() > config.stress_abs_bias {
        Regime::Stress
    } else if trend >= config.trend_deviation && vol_ratio >= config.trend_vol_ratio {
        Regime::Trend
    } else {
        Regime::Range
    }
}

pub fn regime_multiplier(regime: Regime, config: &RegimeConfig) -> f64 {
    match regime {
        Regime::Range => config.range_multiplier,
        Regime::Trend => config.trend_multiplier,
        Regime::Stress => config.stress_multiplier,
    }
}

// ============================================================================
// Position sizer
// ============================================================================

/// `min(capital × risk × weight × regime × per_trade / (atr / close), capital × max_share)`,
/// rounded to whole NTD. Zero when the volatility fraction is not positive.
pub fn position_size(
    strategy_weight: f64,
    atr: f64,
    close: f64,
    regime_mult: f64,
    config: &CapitalConfig,
) -> Decimal {
    let capital = config.total_capital.to_f64().unwrap_or(0.0);
    let vol_pct = if close > 0.0 { atr / close } else { 0.0 };
    if !(vol_pct > 0.0) || !vol_pct.is_finite() {
        return Decimal::ZERO;
    }
    let risk_budget =
        capital * config.max_account_risk * strategy_weight * regime_mult * config.per_trade_risk_ratio;
    let size = (risk_budget / vol_pct).min(capital * config.max_position_share).max(0.0);
    Decimal::from_f64(size).unwrap_or(Decimal::ZERO).round_dp(0)
}

// ============================================================================
// Liquidity gate
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Position forced to zero
    Blocked(Vec<String>),
    /// Position multiplied by the factor (< 1)
    Scaled(f64),
    Pass,
}

#[derive(Debug, Clone, Copy)]
pub struct GateInput {
    pub price: f64,
    pub turnover_pct: Option<f64>,
    pub traded_value: Option<f64>,
    pub annual_vol: Option<f64>,
}

pub struct LiquidityGate<'a> {
    config: &'a LiquidityConfig,
}

impl<'a> LiquidityGate<'a> {
    pub fn new(config: &'a LiquidityConfig) -> Self {
        Self { config }
    }

    pub fn turnover_threshold(&self, price: f64) -> f64 {
        if price >= self.config.price_split {
            self.config.turnover_block_pct_high
        } else {
            self.config.turnover_block_pct_low
        }
    }

    pub fn amount_threshold(&self, price: f64) -> f64 {
        if price >= self.config.price_split {
            self.config.amount_block_high
        } else {
            self.config.amount_block_low
        }
    }

    /// `min(1, max(0, target / realized))`, 1 when volatility is unknown
    pub fn vol_scale(&self, annual_vol: Option<f64>) -> f64 {
        match annual_vol {
            Some(v) if v.is_finite() && v > 0.0 => {
                (self.config.vol_target_annual / v).clamp(0.0, 1.0)
            }
            _ => 1.0,
        }
    }

    pub fn decide(&self, input: &GateInput) -> GateDecision {
        let mut reasons = Vec::new();

        let turn_thr = self.turnover_threshold(input.price);
        if let Some(t) = input.turnover_pct.filter(|t| t.is_finite()) {
            if t < turn_thr {
                reasons.push(format!("low turnover <{:.2}%", turn_thr));
            }
        }
        let amt_thr = self.amount_threshold(input.price);
        if let Some(v) = input.traded_value.filter(|v| v.is_finite()) {
            if v < amt_thr {
                reasons.push(format!("low traded value <{:.0}", amt_thr));
            }
        }
        if !reasons.is_empty() {
            return GateDecision::Blocked(reasons);
        }

        let scale = self.vol_scale(input.annual_vol);
        if scale < 1.0 {
            GateDecision::Scaled(scale)
        } else {
            GateDecision::Pass
        }
    }

    /// Apply a decision, returning the final size and any annotations
    pub fn apply(&self, position: Decimal, decision: &GateDecision) -> (Decimal, Vec<String>) {
        match decision {
            GateDecision::Blocked(reasons) => {
                let mut notes = reasons.clone();
                notes.push("blocked (position=0)".to_string());
                (Decimal::ZERO, notes)
            }
            GateDecision::Scaled(factor) => {
                let f = Decimal::from_f64(*factor).unwrap_or(Decimal::ONE);
                ((position * f).round_dp(0), vec![format!("vol scale x{:.2}", factor)])
            }
            GateDecision::Pass => (position, Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::tests::make_bars;
    use rust_decimal_macros::dec;

    #[test]
    fn test_regime_short_history_is_range() {
        let bars = make_bars(&vec![100.0; 30], 1.0);
        assert_eq!(classify_regime(&bars, &RegimeConfig::default()), Regime::Range);
    }

    #[test]
    fn test_regime_trend() {
        // flat, then a choppy step up: close sits ~8% above MA60, bias stays small
        let mut closes = vec![100.0; 60];
        closes.extend((0..20).map(|i| if i % 2 == 0 { 102.0 } else { 110.0 }));
        let bars = make_bars(&closes, 1.0);
        assert_eq!(classify_regime(&bars, &RegimeConfig::default()), Regime::Trend);
    }

    #[test]
    fn test_regime_stress() {
        // flat then a crash inside the last 20 bars
        let mut closes = vec![100.0; 60];
        closes.extend((0..20).map(|i| 100.0 - i as f64 * 2.0));
        let bars = make_bars(&closes, 1.0);
        assert_eq!(classify_regime(&bars, &RegimeConfig::default()), Regime::Stress);
    }

    #[test]
    fn test_regime_flat_is_range() {
        let bars = make_bars(&vec![100.0; 80], 1.0);
        assert_eq!(classify_regime(&bars, &RegimeConfig::default()), Regime::Range);
    }

    #[test]
    fn test_position_size_formula() {
        let config = CapitalConfig::default();
        // 300000 * 0.1 * 0.5 * 1.0 * 0.2 / (2 / 100) = 150000, capped at 150000
        assert_eq!(position_size(0.5, 2.0, 100.0, 1.0, &config), dec!(150000));
        // 300000 * 0.1 * 0.25 * 1.0 * 0.2 / 0.05 = 30000
        assert_eq!(position_size(0.25, 5.0, 100.0, 1.0, &config), dec!(30000));
        // stress halves it
        assert_eq!(position_size(0.25, 5.0, 100.0, 0.5, &config), dec!(15000));
    }

    #[test]
    fn test_position_size_degenerate_volatility() {
        let config = CapitalConfig::default();
        assert_eq!(position_size(0.5, 0.0, 100.0, 1.0, &config), Decimal::ZERO);
        assert_eq!(position_size(0.5, 2.0, 0.0, 1.0, &config), Decimal::ZERO);
    }

    #[test]
    fn test_gate_blocks_low_traded_value() {
        let config = LiquidityConfig::default();
        let gate = LiquidityGate::new(&config);
        let decision = gate.decide(&GateInput {
            price: 50.0,
            turnover_pct: Some(2.0),
            traded_value: Some(2_500_000.0),
            annual_vol: Some(0.2),
        });
        assert!(matches!(decision, GateDecision::Blocked(_)));
        let (size, notes) = gate.apply(dec!(120000), &decision);
        assert_eq!(size, Decimal::ZERO);
        assert!(notes.iter().any(|n| n.contains("blocked")));
    }

    #[test]
    fn test_gate_thresholds_by_price_bucket() {
        let config = LiquidityConfig::default();
        let gate = LiquidityGate::new(&config);
        // 5M clears the low bucket but not the high one
        let low = GateInput { price: 150.0, turnover_pct: Some(1.0), traded_value: Some(5_000_000.0), annual_vol: None };
        let high = GateInput { price: 250.0, ..low };
        assert_eq!(gate.decide(&low), GateDecision::Pass);
        assert!(matches!(gate.decide(&high), GateDecision::Blocked(_)));

        // 0.15% turnover blocks below the split, passes above it
        let thin_low = GateInput { price: 150.0, turnover_pct: Some(0.15), traded_value: Some(50_000_000.0), annual_vol: None };
        let thin_high = GateInput { price: 250.0, ..thin_low };
        assert!(matches!(gate.decide(&thin_low), GateDecision::Blocked(_)));
        assert_eq!(gate.decide(&thin_high), GateDecision::Pass);
    }

    #[test]
    fn test_gate_vol_scaling() {
        let config = LiquidityConfig::default();
        let gate = LiquidityGate::new(&config);
        let decision = gate.decide(&GateInput {
            price: 80.0,
            turnover_pct: Some(1.0),
            traded_value: Some(50_000_000.0),
            annual_vol: Some(0.70),
        });
        assert_eq!(decision, GateDecision::Scaled(0.5));
        let (size, notes) = gate.apply(dec!(100000), &decision);
        assert_eq!(size, dec!(50000));
        assert_eq!(notes, vec!["vol scale x0.50".to_string()]);
    }
}
