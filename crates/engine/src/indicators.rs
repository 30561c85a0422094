//! Indicator normalizer
//!
//! Turns a daily OHLCV history into the dimensionless indicators the
//! classifier and scorer consume. Rolling windows go through `ta`
//! indicators fed bar by bar; only the final value of each is kept.

use ta::indicators::{Maximum, Minimum, SimpleMovingAverage};
use ta::Next;

use crate::config::IndicatorConfig;
use crate::types::{Bar, Indicators};

const TRADING_DAYS: f64 = 252.0;

// ============================================================================
// Rolling helpers
// ============================================================================

/// Mean of the last `period` values
pub(crate) fn last_sma(values: impl IntoIterator<Item = f64>, period: usize) -> Option<f64> {
    let mut sma = SimpleMovingAverage::new(period).ok()?;
    values.into_iter().map(|v| sma.next(v)).last()
}

/// High−low range over the last `period` bars
pub(crate) fn last_range(bars: &[Bar], period: usize) -> Option<f64> {
    let mut max = Maximum::new(period).ok()?;
    let mut min = Minimum::new(period).ok()?;
    let mut hi = None;
    let mut lo = None;
    for bar in bars {
        hi = Some(max.next(bar.high));
        lo = Some(min.next(bar.low));
    }
    Some(hi? - lo?)
}

fn last_low(bars: &[Bar], period: usize) -> Option<f64> {
    let mut min = Minimum::new(period).ok()?;
    bars.iter().map(|b| min.next(b.low)).last()
}

fn true_ranges(bars: &[Bar]) -> impl Iterator<Item = f64> + '_ {
    bars.iter().enumerate().map(move |(i, bar)| {
        let hl = bar.high - bar.low;
        match i.checked_sub(1).map(|p| bars[p].close) {
            Some(prev) => hl.max((bar.high - prev).abs()).max((bar.low - prev).abs()),
            None => hl,
        }
    })
}

/// Annualized sample standard deviation of the last `lookback` daily returns
pub fn realized_annual_vol(bars: &[Bar], lookback: usize) -> Option<f64> {
    if lookback < 2 || bars.len() < lookback + 1 {
        return None;
    }
    let window = &bars[bars.len() - lookback - 1..];
    let returns: Vec<f64> = window
        .windows(2)
        .filter(|w| w[0].close > 0.0)
        .map(|w| w[1].close / w[0].close - 1.0)
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let vol = var.sqrt() * TRADING_DAYS.sqrt();
    vol.is_finite().then_some(vol)
}

// ============================================================================
// Normalizer
// ============================================================================

/// Compute indicators, or `None` when the history is too short, too thin,
/// or yields non-finite values.
pub fn compute_indicators(bars: &[Bar], config: &IndicatorConfig) -> Option<Indicators> {
    if bars.len() < config.min_bars.max(60) {
        return None;
    }

    let avg_volume20 = last_sma(bars.iter().map(|b| b.volume), 20)?;
    if !(avg_volume20 >= config.min_avg_volume) {
        return None;
    }

    let last = bars.last()?;
    let close = last.close;
    let ma20 = last_sma(bars.iter().map(|b| b.close), 20)?;
    if !ma20.is_finite() || ma20 <= 0.0 {
        return None;
    }
    let bias_pct = (close - ma20) / ma20 * 100.0;
    if !bias_pct.is_finite() {
        return None;
    }

    let atr20 = last_sma(true_ranges(bars), 20)?;
    if !atr20.is_finite() || atr20 <= 0.0 {
        return None;
    }

    let range20 = last_range(bars, 20)?;
    let range60 = last_range(bars, 60)?;
    let vol_ratio = if range60 > 0.0 { range20 / range60 } else { 0.0 };

    let avg_volume5 = last_sma(bars.iter().map(|b| b.volume), 5)?;
    let volume_ratio = if avg_volume20 > 0.0 { avg_volume5 / avg_volume20 } else { 0.0 };

    let support = last_low(bars, 20)?;

    Some(Indicators {
        close,
        ma20,
        bias_pct,
        support,
        atr20,
        vol_ratio,
        volume_ratio,
        avg_volume20,
        last_volume: last.volume,
        annual_vol: realized_annual_vol(bars, config.vol_lookback),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};

    pub(crate) fn make_bars(closes: &[f64], volume: f64) -> Vec<Bar> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Bar {
                date: start + Duration::days(i as i64),
                open: c,
                high: c + 1.0,
                low: c - 1.0,
                close: c,
                volume,
            })
            .collect()
    }

    fn config() -> IndicatorConfig {
        IndicatorConfig::default()
    }

    #[test]
    fn test_short_history_rejected() {
        let bars = make_bars(&vec![100.0; 59], 500_000.0);
        assert!(compute_indicators(&bars, &config()).is_none());
    }

    #[test]
    fn test_thin_volume_rejected() {
        let bars = make_bars(&vec![100.0; 80], 50_000.0);
        assert!(compute_indicators(&bars, &config()).is_none());
    }

    #[test]
    fn test_flat_series() {
        let bars = make_bars(&vec![100.0; 80], 500_000.0);
        let ind = compute_indicators(&bars, &config()).unwrap();
        assert!((ind.ma20 - 100.0).abs() < 1e-9);
        assert!(ind.bias_pct.abs() < 1e-9);
        // every bar has a 2.0 high-low range and no gaps
        assert!((ind.atr20 - 2.0).abs() < 1e-9);
        assert!((ind.vol_ratio - 1.0).abs() < 1e-9);
        assert!((ind.volume_ratio - 1.0).abs() < 1e-9);
        assert!((ind.support - 99.0).abs() < 1e-9);
        assert_eq!(ind.annual_vol, Some(0.0));
    }

    #[test]
    fn test_drop_gives_negative_bias() {
        let mut closes = vec![100.0; 70];
        closes.extend([95.0, 92.0, 90.0, 88.0, 86.0]);
        let bars = make_bars(&closes, 300_000.0);
        let ind = compute_indicators(&bars, &config()).unwrap();
        assert!(ind.bias_pct < -5.0, "bias {}", ind.bias_pct);
        assert!((ind.support - 85.0).abs() < 1e-9);
        assert!(ind.annual_vol.unwrap() > 0.0);
    }

    #[test]
    fn test_true_range_uses_gap() {
        let bars = make_bars(&[100.0, 110.0], 1.0);
        let trs: Vec<f64> = true_ranges(&bars).collect();
        assert_eq!(trs[0], 2.0);
        // high 111 vs prev close 100
        assert_eq!(trs[1], 11.0);
    }

    #[test]
    fn test_realized_vol_needs_enough_returns() {
        let bars = make_bars(&[100.0, 101.0, 102.0], 1.0);
        assert!(realized_annual_vol(&bars, 20).is_none());
        assert!(realized_annual_vol(&bars, 2).is_some());
    }
}
