//! Strategy weight engine
//!
//! Turns the previous period's per-strategy performance into a weight per
//! strategy active today:
//!
//! 1. no usable performance → equal weights (mode EQUAL)
//! 2. raw score per strategy, normalized and capped → `raw_all`
//! 3. with a persisted prior and smoothing on, `α·raw_all + (1−α)·prior`,
//!    capped again (mode DYNAMIC_SMOOTHED); otherwise `raw_all` (DYNAMIC)
//! 4. restricted to today's strategies, unseen ones at epsilon, renormalized
//!
//! The computation is pure; loading the prior and persisting the result is
//! the pipeline's job.

use persistence::repository::StoredWeights;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::WeightConfig;

const CAP_TOLERANCE: f64 = 1e-12;

/// Previous-period performance of one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceInput {
    pub strategy: String,
    pub annualized_pct: f64,
    pub max_drawdown_pct: f64,
    pub trades: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSummary {
    /// Where the rows came from (file path or "closed_trades")
    pub source: String,
    pub rows: Vec<PerformanceInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WeightMode {
    Equal,
    Dynamic,
    DynamicSmoothed,
}

impl WeightMode {
    pub fn label(&self) -> &'static str {
        match self {
            WeightMode::Equal => "EQUAL",
            WeightMode::Dynamic => "DYNAMIC",
            WeightMode::DynamicSmoothed => "DYNAMIC_SMOOTHED",
        }
    }
}

impl std::fmt::Display for WeightMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// How one strategy's weight was reached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightTrace {
    pub strategy: String,
    pub mode: WeightMode,
    pub source: Option<String>,
    pub score_raw: Option<f64>,
    pub raw_weight: Option<f64>,
    pub prev_weight: Option<f64>,
    pub used_weight: f64,
    pub alpha: Option<f64>,
    pub min_trades: u32,
    pub trades: Option<u32>,
    pub annualized_pct: Option<f64>,
    pub max_drawdown_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightOutcome {
    pub mode: WeightMode,
    /// Used weights of today's strategies, summing to 1
    pub weights: BTreeMap<String, f64>,
    pub trace: Vec<WeightTrace>,
}

impl WeightOutcome {
    pub fn weight(&self, strategy: &str) -> f64 {
        self.weights.get(strategy).copied().unwrap_or(0.0)
    }

    /// Equal weights are a fallback, not a performance signal, so they are
    /// never written back as tomorrow's prior.
    pub fn should_persist(&self) -> bool {
        self.mode != WeightMode::Equal && !self.weights.is_empty()
    }
}

// ============================================================================
// Building blocks
// ============================================================================

/// `max(annualized, 0) / max(|drawdown|, 1)`, scaled down linearly when the
/// trade count is below `min_trades`.
pub fn raw_score(input: &PerformanceInput, min_trades: u32) -> f64 {
    let base = input.annualized_pct.max(0.0) / input.max_drawdown_pct.abs().max(1.0);
    if !base.is_finite() {
        return 0.0;
    }
    match input.trades {
        Some(t) if min_trades > 0 && t < min_trades => base * t as f64 / min_trades as f64,
        _ => base,
    }
}

/// Normalize to sum 1, then clip every weight at `cap` and hand the clipped
/// mass to the uncapped weights in proportion. Repeats until nothing exceeds
/// the cap. When `cap × n < 1` no capped solution exists and the plain
/// normalization is returned.
pub fn cap_and_renormalize(weights: &BTreeMap<String, f64>, cap: f64) -> BTreeMap<String, f64> {
    let n = weights.len();
    if n == 0 {
        return BTreeMap::new();
    }

    let total: f64 = weights.values().filter(|v| v.is_finite() && **v > 0.0).sum();
    let normalized: BTreeMap<String, f64> = weights
        .iter()
        .map(|(k, v)| {
            let v = if v.is_finite() && *v > 0.0 { *v } else { 0.0 };
            let share = if total > 0.0 { v / total } else { 1.0 / n as f64 };
            (k.clone(), share)
        })
        .collect();

    if cap * (n as f64) < 1.0 - CAP_TOLERANCE {
        return normalized;
    }

    let mut out = normalized.clone();
    let mut capped: BTreeSet<String> = BTreeSet::new();
    for _ in 0..n {
        let newly: Vec<String> = out
            .iter()
            .filter(|(k, v)| !capped.contains(*k) && **v > cap + CAP_TOLERANCE)
            .map(|(k, _)| k.clone())
            .collect();
        if newly.is_empty() {
            break;
        }
        capped.extend(newly);

        let free_count = n - capped.len();
        if free_count == 0 {
            break;
        }
        let free_mass = 1.0 - cap * capped.len() as f64;
        let free_sum: f64 = normalized
            .iter()
            .filter(|(k, _)| !capped.contains(*k))
            .map(|(_, v)| *v)
            .sum();

        for (k, v) in out.iter_mut() {
            *v = if capped.contains(k) {
                cap
            } else if free_sum > 0.0 {
                normalized[k] * free_mass / free_sum
            } else {
                free_mass / free_count as f64
            };
        }
    }
    out
}

/// `α·raw + (1−α)·prev` over the union of keys, missing entries as 0
pub fn blend(
    raw: &BTreeMap<String, f64>,
    prev: &BTreeMap<String, f64>,
    alpha: f64,
) -> BTreeMap<String, f64> {
    raw.keys()
        .chain(prev.keys())
        .map(|k| {
            let r = raw.get(k).copied().unwrap_or(0.0);
            let p = prev.get(k).copied().unwrap_or(0.0);
            (k.clone(), alpha * r + (1.0 - alpha) * p)
        })
        .collect()
}

fn renormalize(weights: &mut BTreeMap<String, f64>) {
    let total: f64 = weights.values().sum();
    let n = weights.len() as f64;
    for v in weights.values_mut() {
        *v = if total > 0.0 { *v / total } else { 1.0 / n };
    }
}

// ============================================================================
// Engine
// ============================================================================

fn equal_weights(
    active: &[String],
    prior: Option<&StoredWeights>,
    config: &WeightConfig,
    source: Option<&str>,
) -> WeightOutcome {
    let w = if active.is_empty() { 0.0 } else { 1.0 / active.len() as f64 };
    let weights: BTreeMap<String, f64> = active.iter().map(|s| (s.clone(), w)).collect();
    let trace = active
        .iter()
        .map(|s| WeightTrace {
            strategy: s.clone(),
            mode: WeightMode::Equal,
            source: source.map(|s| s.to_string()),
            score_raw: None,
            raw_weight: None,
            prev_weight: prior.and_then(|p| p.weights.get(s).copied()),
            used_weight: w,
            alpha: None,
            min_trades: config.min_trades,
            trades: None,
            annualized_pct: None,
            max_drawdown_pct: None,
        })
        .collect();
    WeightOutcome {
        mode: WeightMode::Equal,
        weights,
        trace,
    }
}

/// Weights for the strategies active today
pub fn compute_weights(
    active: &[String],
    performance: Option<&PerformanceSummary>,
    prior: Option<&StoredWeights>,
    config: &WeightConfig,
) -> WeightOutcome {
    let active: Vec<String> = active
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let Some(perf) = performance.filter(|p| !p.rows.is_empty()) else {
        return equal_weights(&active, prior, config, None);
    };

    let mut inputs: BTreeMap<String, &PerformanceInput> = BTreeMap::new();
    for row in &perf.rows {
        inputs.entry(row.strategy.trim().to_string()).or_insert(row);
    }
    let scores: BTreeMap<String, f64> = inputs
        .iter()
        .map(|(k, row)| (k.clone(), raw_score(row, config.min_trades)))
        .collect();

    let total: f64 = scores.values().sum();
    if !(total > 0.0) {
        return equal_weights(&active, prior, config, Some(&perf.source));
    }

    let raw_all = cap_and_renormalize(&scores, config.max_strategy_weight);

    let prev = prior.map(|p| &p.weights).filter(|w| !w.is_empty());
    let (mode, smoothed) = match prev {
        Some(prev) if config.smoothing_enabled => {
            let mut blended = blend(&raw_all, prev, config.alpha);
            blended.retain(|_, v| *v > 0.0);
            (
                WeightMode::DynamicSmoothed,
                cap_and_renormalize(&blended, config.max_strategy_weight),
            )
        }
        _ => (WeightMode::Dynamic, raw_all.clone()),
    };

    let mut weights: BTreeMap<String, f64> = active
        .iter()
        .map(|s| {
            let w = smoothed.get(s).copied().filter(|v| *v > 0.0).unwrap_or(config.epsilon);
            (s.clone(), w)
        })
        .collect();
    renormalize(&mut weights);

    let trace = active
        .iter()
        .map(|s| {
            let input = inputs.get(s);
            WeightTrace {
                strategy: s.clone(),
                mode,
                source: Some(perf.source.clone()),
                score_raw: scores.get(s).copied(),
                raw_weight: raw_all.get(s).copied(),
                prev_weight: prev.and_then(|p| p.get(s).copied()),
                used_weight: weights[s],
                alpha: (mode == WeightMode::DynamicSmoothed).then_some(config.alpha),
                min_trades: config.min_trades,
                trades: input.and_then(|i| i.trades),
                annualized_pct: input.map(|i| i.annualized_pct),
                max_drawdown_pct: input.map(|i| i.max_drawdown_pct),
            }
        })
        .collect();

    WeightOutcome {
        mode,
        weights,
        trace,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn perf(rows: &[(&str, f64, f64, Option<u32>)]) -> PerformanceSummary {
        PerformanceSummary {
            source: "performance_summary.csv".to_string(),
            rows: rows
                .iter()
                .map(|(s, ann, mdd, trades)| PerformanceInput {
                    strategy: s.to_string(),
                    annualized_pct: *ann,
                    max_drawdown_pct: *mdd,
                    trades: *trades,
                })
                .collect(),
        }
    }

    fn active(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    fn assert_sums_to_one(weights: &BTreeMap<String, f64>) {
        let total: f64 = weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9, "weights sum to {}", total);
    }

    #[test]
    fn test_cap_and_renormalize_two_strategies() {
        let out = cap_and_renormalize(&map(&[("A", 0.9), ("B", 0.1)]), 0.5);
        assert!((out["A"] - 0.5).abs() < 1e-12);
        assert!((out["B"] - 0.5).abs() < 1e-12);
        assert_sums_to_one(&out);
    }

    #[test]
    fn test_cap_and_renormalize_cascades() {
        let out = cap_and_renormalize(&map(&[("A", 0.6), ("B", 0.3), ("C", 0.1)]), 0.4);
        assert!((out["A"] - 0.4).abs() < 1e-12);
        assert!((out["B"] - 0.4).abs() < 1e-12);
        assert!((out["C"] - 0.2).abs() < 1e-12);
        assert_sums_to_one(&out);
    }

    #[test]
    fn test_cap_infeasible_falls_back_to_normalization() {
        let out = cap_and_renormalize(&map(&[("A", 3.0)]), 0.5);
        assert!((out["A"] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cap_zero_mass_spread_evenly() {
        let out = cap_and_renormalize(&map(&[("A", 1.0), ("B", 0.0), ("C", 0.0)]), 0.5);
        assert!((out["A"] - 0.5).abs() < 1e-12);
        assert!((out["B"] - 0.25).abs() < 1e-12);
        assert_sums_to_one(&out);
    }

    #[test]
    fn test_blend_toward_prior() {
        let out = blend(&map(&[("A", 1.0)]), &map(&[("A", 0.4), ("B", 0.6)]), 0.30);
        assert!((out["A"] - 0.58).abs() < 1e-12);
        assert!((out["B"] - 0.42).abs() < 1e-12);
    }

    #[test]
    fn test_raw_score() {
        let input = PerformanceInput {
            strategy: "MEAN_REVERT".into(),
            annualized_pct: 30.0,
            max_drawdown_pct: -10.0,
            trades: Some(10),
        };
        // 30 / 10, halved for 10 of 20 trades
        assert!((raw_score(&input, 20) - 1.5).abs() < 1e-12);

        let shallow = PerformanceInput { max_drawdown_pct: -0.5, annualized_pct: 5.0, trades: None, ..input.clone() };
        assert!((raw_score(&shallow, 20) - 5.0).abs() < 1e-12);

        let losing = PerformanceInput { annualized_pct: -12.0, ..input };
        assert_eq!(raw_score(&losing, 20), 0.0);
    }

    #[test]
    fn test_no_performance_is_equal() {
        let out = compute_weights(&active(&["MEAN_REVERT", "SQUEEZE_PRIMARY"]), None, None, &WeightConfig::default());
        assert_eq!(out.mode, WeightMode::Equal);
        assert!((out.weight("MEAN_REVERT") - 0.5).abs() < 1e-12);
        assert!(!out.should_persist());
    }

    #[test]
    fn test_all_losing_is_equal() {
        let p = perf(&[("MEAN_REVERT", -5.0, -20.0, Some(30)), ("SQUEEZE_PRIMARY", 0.0, -3.0, Some(30))]);
        let out = compute_weights(&active(&["MEAN_REVERT", "SQUEEZE_PRIMARY"]), Some(&p), None, &WeightConfig::default());
        assert_eq!(out.mode, WeightMode::Equal);
        assert_eq!(out.trace[0].source.as_deref(), Some("performance_summary.csv"));
    }

    #[test]
    fn test_dynamic_without_prior() {
        let p = perf(&[
            ("MEAN_REVERT", 40.0, -10.0, Some(40)),
            ("SQUEEZE_PRIMARY", 10.0, -10.0, Some(40)),
            ("HIGH_MARGIN_MEAN_REVERT", 10.0, -10.0, Some(40)),
        ]);
        let out = compute_weights(
            &active(&["MEAN_REVERT", "SQUEEZE_PRIMARY", "HIGH_MARGIN_MEAN_REVERT"]),
            Some(&p),
            None,
            &WeightConfig::default(),
        );
        assert_eq!(out.mode, WeightMode::Dynamic);
        // raw 4:1:1 → 0.667 capped to 0.5, rest split evenly
        assert!((out.weight("MEAN_REVERT") - 0.5).abs() < 1e-9);
        assert!((out.weight("SQUEEZE_PRIMARY") - 0.25).abs() < 1e-9);
        assert_sums_to_one(&out.weights);
        assert!(out.should_persist());
    }

    #[test]
    fn test_smoothed_with_prior_and_new_strategy_gets_epsilon() {
        let p = perf(&[("MEAN_REVERT", 20.0, -10.0, Some(40)), ("SQUEEZE_PRIMARY", 20.0, -10.0, Some(40))]);
        let prior = StoredWeights {
            updated_on: "2024-05-01".into(),
            weights: map(&[("MEAN_REVERT", 0.7), ("SQUEEZE_PRIMARY", 0.3)]),
        };
        let out = compute_weights(
            &active(&["MEAN_REVERT", "SQUEEZE_SECONDARY"]),
            Some(&p),
            Some(&prior),
            &WeightConfig::default(),
        );
        assert_eq!(out.mode, WeightMode::DynamicSmoothed);
        assert_sums_to_one(&out.weights);
        let newcomer = out.weight("SQUEEZE_SECONDARY");
        assert!(newcomer > 0.0 && newcomer < 1e-5, "newcomer weight {}", newcomer);
        assert!(!out.weights.contains_key("SQUEEZE_PRIMARY"));

        let trace = out.trace.iter().find(|t| t.strategy == "MEAN_REVERT").unwrap();
        assert_eq!(trace.prev_weight, Some(0.7));
        assert_eq!(trace.alpha, Some(0.30));
    }

    #[test]
    fn test_smoothing_disabled_ignores_prior() {
        let p = perf(&[("MEAN_REVERT", 20.0, -10.0, Some(40))]);
        let prior = StoredWeights {
            updated_on: "2024-05-01".into(),
            weights: map(&[("SQUEEZE_PRIMARY", 1.0)]),
        };
        let config = WeightConfig { smoothing_enabled: false, ..Default::default() };
        let out = compute_weights(&active(&["MEAN_REVERT"]), Some(&p), Some(&prior), &config);
        assert_eq!(out.mode, WeightMode::Dynamic);
        assert!((out.weight("MEAN_REVERT") - 1.0).abs() < 1e-12);
    }
}
