//! Strategy classifier and squeeze pressure
//!
//! One decision per security, single pass. Squeeze states are checked before
//! the mean-revert family, so a security qualifying for both is a squeeze.

use crate::config::ClassifierConfig;
use crate::types::{Indicators, Market, RatioStatus, StrategyLabel};

/// Ratio at which pressure starts rising from 0
const PRESSURE_RATIO_FLOOR: f64 = 9.0;
/// Ratio at which pressure saturates at 1
const PRESSURE_RATIO_CAP: f64 = 30.0;

/// Pressure from a known short/margin ratio
pub fn pressure_from_ratio(ratio: f64) -> f64 {
    ((ratio - PRESSURE_RATIO_FLOOR) / (PRESSURE_RATIO_CAP - PRESSURE_RATIO_FLOOR)).clamp(0.0, 1.0)
}

/// Range/volume proxy used when no ratio is available
pub fn pressure_proxy(vol_ratio: f64, volume_ratio: f64) -> f64 {
    let raw = 0.6 * vol_ratio + 0.4 * volume_ratio;
    if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Squeeze pressure is always populated: ratio-derived when the ratio is
/// OK, the proxy otherwise.
pub fn squeeze_pressure(status: RatioStatus, ratio: Option<f64>, indicators: &Indicators) -> f64 {
    match (status, ratio) {
        (RatioStatus::Ok, Some(r)) if r.is_finite() => pressure_from_ratio(r),
        _ => pressure_proxy(indicators.vol_ratio, indicators.volume_ratio),
    }
}

pub struct ClassifierInput<'a> {
    pub market: Market,
    pub indicators: &'a Indicators,
    /// Only present when the ratio status is OK
    pub ratio: Option<f64>,
    pub squeeze_pressure: f64,
}

pub fn classify(input: &ClassifierInput<'_>, config: &ClassifierConfig) -> Option<StrategyLabel> {
    let ind = input.indicators;

    let squeeze_primary = input.market == Market::Primary
        && input.ratio.is_some_and(|r| r >= config.squeeze_ratio)
        && ind.vol_ratio >= config.squeeze_vol_ratio
        && ind.volume_ratio >= config.squeeze_volume_ratio
        && ind.close >= ind.ma20
        && ind.bias_pct >= config.squeeze_min_bias;
    if squeeze_primary {
        return Some(StrategyLabel::SqueezePrimary);
    }

    if input.market == Market::Secondary && input.squeeze_pressure >= config.squeeze_pressure {
        return Some(StrategyLabel::SqueezeSecondary);
    }

    let above_support = ind.close >= ind.support * (1.0 + config.support_tolerance);
    if !above_support {
        return None;
    }
    if ind.bias_pct <= config.bias_deep {
        Some(StrategyLabel::HighMarginMeanRevert)
    } else if ind.bias_pct <= config.bias_mean_revert {
        Some(StrategyLabel::MeanRevert)
    } else {
        None
    }
}
