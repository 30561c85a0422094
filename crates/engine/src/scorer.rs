//! Composite scorer and traffic lights
//!
//! Each dimension is percentile-ranked across the batch, blended with fixed
//! weights, and reduced by a liquidity/volatility penalty. Lights are a
//! display classification only and never feed the score.

use crate::config::ScoringConfig;
use crate::types::Light;

/// Inputs of one row to the composite score
#[derive(Debug, Clone, Default)]
pub struct ScoreInput {
    pub target_position: f64,
    pub strategy_score: f64,
    pub abs_bias: Option<f64>,
    pub turnover_pct: Option<f64>,
    pub traded_value: Option<f64>,
    pub price: Option<f64>,
    pub annual_vol: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreOutput {
    pub composite: f64,
    pub penalty: f64,
}

fn present(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

/// Percentile rank in (0, 1] with average ranks for ties. Missing values
/// rank 0; a dimension with no values at all is a zero vector.
pub fn percentile_rank(values: &[Option<f64>]) -> Vec<f64> {
    let mut indexed: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| present(*v).map(|x| (i, x)))
        .collect();
    let mut out = vec![0.0; values.len()];
    let n = indexed.len();
    if n == 0 {
        return out;
    }
    indexed.sort_by(|a, b| a.1.total_cmp(&b.1));

    let mut start = 0;
    while start < n {
        let mut end = start;
        while end + 1 < n && indexed[end + 1].1 == indexed[start].1 {
            end += 1;
        }
        // 1-based ranks start+1 ..= end+1
        let avg_rank = (start + end) as f64 / 2.0 + 1.0;
        for item in &indexed[start..=end] {
            out[item.0] = avg_rank / n as f64;
        }
        start = end + 1;
    }
    out
}

/// Missing entries become 0 unless the whole dimension is missing
fn fill_missing_with_zero(values: &[Option<f64>]) -> Vec<Option<f64>> {
    if values.iter().all(|v| present(*v).is_none()) {
        return values.to_vec();
    }
    values.iter().map(|v| Some(present(*v).unwrap_or(0.0))).collect()
}

/// Traded-value floor for a price
pub fn amount_threshold(price: Option<f64>, config: &ScoringConfig) -> f64 {
    let bands = &config.amount_bands;
    let fallback = bands.first().map(|b| b.floor).unwrap_or(0.0);
    let Some(price) = present(price) else {
        return fallback;
    };
    bands
        .iter()
        .find(|b| b.below_price.map_or(true, |limit| price < limit))
        .map(|b| b.floor)
        .unwrap_or(fallback)
}

pub fn liquidity_penalty(input: &ScoreInput, config: &ScoringConfig) -> f64 {
    let Some(tv) = present(input.traded_value) else {
        return 0.0;
    };
    let threshold = amount_threshold(input.price, config);
    let mut penalty = 0.0;
    if tv < threshold {
        penalty += config.penalty_low_value;
    }
    if present(input.annual_vol).is_some_and(|v| v > config.high_vol_threshold)
        && tv < 1.5 * threshold
    {
        penalty += config.penalty_high_vol;
    }
    penalty
}

/// Composite score for every row of the batch
pub fn composite_scores(rows: &[ScoreInput], config: &ScoringConfig) -> Vec<ScoreOutput> {
    let position: Vec<Option<f64>> = rows.iter().map(|r| Some(r.target_position)).collect();
    let strategy: Vec<Option<f64>> = rows.iter().map(|r| Some(r.strategy_score)).collect();
    let bias: Vec<Option<f64>> = rows.iter().map(|r| r.abs_bias.map(f64::abs)).collect();
    let turnover: Vec<Option<f64>> = rows.iter().map(|r| r.turnover_pct).collect();
    let value: Vec<Option<f64>> = rows.iter().map(|r| r.traded_value).collect();

    let r_pos = percentile_rank(&position);
    let r_strategy = percentile_rank(&strategy);
    let r_bias = percentile_rank(&fill_missing_with_zero(&bias));
    let r_turn = percentile_rank(&fill_missing_with_zero(&turnover));
    let r_value = percentile_rank(&fill_missing_with_zero(&value));

    rows.iter()
        .enumerate()
        .map(|(i, row)| {
            let blended = config.weight_position * r_pos[i]
                + config.weight_strategy * r_strategy[i]
                + config.weight_bias * r_bias[i]
                + config.weight_turnover * r_turn[i]
                + config.weight_traded_value * r_value[i];
            let penalty = liquidity_penalty(row, config);
            ScoreOutput {
                composite: blended - penalty,
                penalty,
            }
        })
        .collect()
}

/// Descending integer rank by traded value (1 = largest, ties share the
/// best rank). Missing values get no rank.
pub fn traded_value_ranks(values: &[Option<f64>]) -> Vec<Option<u32>> {
    values
        .iter()
        .map(|v| {
            let x = present(*v)?;
            let larger = values
                .iter()
                .filter(|o| present(**o).is_some_and(|y| y > x))
                .count();
            Some(larger as u32 + 1)
        })
        .collect()
}

// ============================================================================
// Lights
// ============================================================================

pub fn turnover_light(turnover_pct: Option<f64>, config: &ScoringConfig) -> Light {
    match present(turnover_pct) {
        None => Light::NotAvailable,
        Some(v) if v == 0.0 => Light::NotAvailable,
        Some(v) if v >= config.turnover_green => Light::Green,
        Some(v) if v >= config.turnover_yellow => Light::Yellow,
        Some(_) => Light::Red,
    }
}

/// Higher pressure is worse
pub fn pressure_light(pressure: f64, config: &ScoringConfig) -> Light {
    if !pressure.is_finite() {
        return Light::NotAvailable;
    }
    if pressure >= config.pressure_red {
        Light::Red
    } else if pressure >= config.pressure_yellow {
        Light::Yellow
    } else {
        Light::Green
    }
}

/// Lower rank number (larger traded value) is better
pub fn traded_value_rank_light(rank: Option<u32>, config: &ScoringConfig) -> Light {
    match rank {
        None => Light::NotAvailable,
        Some(r) if r <= config.value_rank_green => Light::Green,
        Some(r) if r <= config.value_rank_yellow => Light::Yellow,
        Some(_) => Light::Red,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_row(position: f64, strategy: f64, bias: f64, turnover: f64, value: f64) -> ScoreInput {
        ScoreInput {
            target_position: position,
            strategy_score: strategy,
            abs_bias: Some(bias),
            turnover_pct: Some(turnover),
            traded_value: Some(value),
            price: Some(50.0),
            annual_vol: Some(0.3),
        }
    }

    #[test]
    fn test_percentile_rank_average_ties() {
        let r = percentile_rank(&[Some(1.0), Some(2.0), Some(2.0), Some(3.0)]);
        assert_eq!(r, vec![0.25, 0.625, 0.625, 1.0]);
    }

    #[test]
    fn test_percentile_rank_missing() {
        let r = percentile_rank(&[Some(5.0), None, Some(f64::NAN)]);
        assert_eq!(r, vec![1.0, 0.0, 0.0]);
        assert_eq!(percentile_rank(&[None, None]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_amount_threshold_bands() {
        let config = ScoringConfig::default();
        assert_eq!(amount_threshold(Some(10.0), &config), 3_000_000.0);
        assert_eq!(amount_threshold(Some(20.0), &config), 5_000_000.0);
        assert_eq!(amount_threshold(Some(99.9), &config), 8_000_000.0);
        assert_eq!(amount_threshold(Some(150.0), &config), 12_000_000.0);
        assert_eq!(amount_threshold(Some(650.0), &config), 18_000_000.0);
        assert_eq!(amount_threshold(None, &config), 3_000_000.0);
    }

    #[test]
    fn test_penalties() {
        let config = ScoringConfig::default();
        let mut row = make_row(1.0, 1.0, 1.0, 1.0, 4_000_000.0);
        // price 50 → 8M floor
        assert!((liquidity_penalty(&row, &config) - 0.30).abs() < 1e-12);
        row.annual_vol = Some(0.8);
        assert!((liquidity_penalty(&row, &config) - 0.60).abs() < 1e-12);
        row.traded_value = Some(10_000_000.0);
        // above the floor but under 1.5× with high vol
        assert!((liquidity_penalty(&row, &config) - 0.30).abs() < 1e-12);
        row.traded_value = None;
        assert_eq!(liquidity_penalty(&row, &config), 0.0);
    }

    #[test]
    fn test_composite_monotone_in_traded_value() {
        let config = ScoringConfig::default();
        let mut rows = vec![
            make_row(10_000.0, 0.3, 7.0, 0.5, 50_000_000.0),
            make_row(20_000.0, 0.2, 9.0, 0.8, 60_000_000.0),
            make_row(15_000.0, 0.5, 6.5, 0.3, 70_000_000.0),
        ];
        let before = composite_scores(&rows, &config)[0].composite;
        rows[0].traded_value = Some(80_000_000.0);
        let after = composite_scores(&rows, &config)[0].composite;
        assert!(after > before, "score went from {} to {}", before, after);
    }

    #[test]
    fn test_composite_missing_dimension_contributes_zero() {
        let config = ScoringConfig::default();
        let mut a = make_row(1.0, 1.0, 1.0, 1.0, 50_000_000.0);
        let mut b = make_row(2.0, 2.0, 2.0, 2.0, 60_000_000.0);
        a.turnover_pct = None;
        b.turnover_pct = None;
        let out = composite_scores(&[a, b], &config);
        // b tops every remaining dimension: 0.25 + 0.25 + 0.20 + 0.20
        assert!((out[1].composite - 0.90).abs() < 1e-12);
    }

    #[test]
    fn test_traded_value_ranks() {
        let ranks = traded_value_ranks(&[Some(5.0), Some(9.0), None, Some(9.0), Some(1.0)]);
        assert_eq!(ranks, vec![Some(3), Some(1), None, Some(1), Some(4)]);
    }

    #[test]
    fn test_lights() {
        let config = ScoringConfig::default();
        assert_eq!(turnover_light(Some(1.2), &config), Light::Green);
        assert_eq!(turnover_light(Some(0.5), &config), Light::Yellow);
        assert_eq!(turnover_light(Some(0.1), &config), Light::Red);
        assert_eq!(turnover_light(Some(0.0), &config), Light::NotAvailable);
        assert_eq!(turnover_light(None, &config), Light::NotAvailable);

        assert_eq!(pressure_light(0.95, &config), Light::Red);
        assert_eq!(pressure_light(0.75, &config), Light::Yellow);
        assert_eq!(pressure_light(0.10, &config), Light::Green);
        assert_eq!(pressure_light(f64::NAN, &config), Light::NotAvailable);

        assert_eq!(traded_value_rank_light(Some(1), &config), Light::Green);
        assert_eq!(traded_value_rank_light(Some(450), &config), Light::Yellow);
        assert_eq!(traded_value_rank_light(Some(900), &config), Light::Red);
        assert_eq!(traded_value_rank_light(None, &config), Light::NotAvailable);
    }
}
