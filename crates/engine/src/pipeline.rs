//! Daily run orchestration
//!
//! Universe → ratios → shares → regime → histories → candidates →
//! classification → weights → scoring → sizing and gating → ranked records.
//!
//! Every per-run lookup (display names, ratios, shares, invalid tickers)
//! lives in an explicit [`RunContext`] passed through the stages. Nothing is
//! global, and the pure stages ([`build_candidates`], [`assemble_records`])
//! can be driven directly from tests.

use chrono::{Duration as ChronoDuration, NaiveDate};
use persistence::repository::{NewSnapshotRow, SnapshotRepository, WeightStateRepository};
use persistence::Database;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{
    build_client, IsinUniverse, OfficialShares, TpexDatedMargin, TpexLatestMargin, TpexUniverse,
    TwseDatedMargin, TwseLatestMargin, TwseUniverse, YahooClient,
};
use crate::cache::{CachedSource, FileCache};
use crate::classifier::{classify, squeeze_pressure, ClassifierInput};
use crate::config::{ClassifierConfig, IndicatorConfig, ScreenerConfig};
use crate::error::{EngineError, EngineResult};
use crate::history::{load_histories, HistoryLoader};
use crate::indicators::compute_indicators;
use crate::performance::resolve_performance;
use crate::ratio::{resolve_ratios, RatioResolution};
use crate::scorer::{
    composite_scores, pressure_light, traded_value_rank_light, traded_value_ranks, turnover_light,
    ScoreInput,
};
use crate::sizing::{classify_regime, position_size, regime_multiplier, GateInput, LiquidityGate};
use crate::sources::{FallbackChain, HistoryProvider, HistoryRange, WalkBack};
use crate::types::{
    Bar, Candidate, Lights, MarginRow, Market, Regime, SecurityKey, SecurityRecord, StrategyLabel,
};
use crate::universe::{build_universe, Universe, UniverseEntry};
use crate::weights::{compute_weights, WeightOutcome};

const SHARES_CACHE_KEY: &str = "issued_shares";
const STOP_LOSS_FALLBACK: f64 = 0.95;

// ============================================================================
// Sources
// ============================================================================

/// Every upstream the run reads, in priority order per concern
pub struct Sources {
    pub primary_universe: FallbackChain<Vec<UniverseEntry>>,
    pub secondary_universe: FallbackChain<Vec<UniverseEntry>>,
    pub primary_margin: FallbackChain<Vec<MarginRow>>,
    pub secondary_margin: FallbackChain<Vec<MarginRow>>,
    pub shares: FallbackChain<HashMap<String, f64>>,
    pub history: Arc<dyn HistoryProvider>,
    pub history_cache: Option<FileCache>,
}

impl Sources {
    /// Production wiring over one shared HTTP client
    pub fn live(config: &ScreenerConfig, cache_dir: &Path) -> EngineResult<Self> {
        let client = build_client(&config.fetch)?;
        let lookback = config.ratio.lookback_days;

        let shares_cache = FileCache::new(
            cache_dir.join("shares"),
            ChronoDuration::hours(config.fetch.shares_cache_ttl_hours),
        );
        let history_cache = FileCache::new(
            cache_dir.join("history"),
            ChronoDuration::hours(config.fetch.history_cache_ttl_hours),
        );

        Ok(Self {
            primary_universe: FallbackChain::new("universe-primary")
                .then(TwseUniverse::new(client.clone()))
                .then(IsinUniverse::new(client.clone(), Market::Primary)),
            secondary_universe: FallbackChain::new("universe-secondary")
                .then(TpexUniverse::new(client.clone()))
                .then(IsinUniverse::new(client.clone(), Market::Secondary)),
            primary_margin: FallbackChain::new("margin-primary")
                .then(TwseLatestMargin::new(client.clone(), config.ratio.latest_attempts))
                .then(WalkBack::new(TwseDatedMargin::new(client.clone()), lookback)),
            secondary_margin: FallbackChain::new("margin-secondary")
                .then(TpexLatestMargin::new(client.clone()))
                .then(WalkBack::new(TpexDatedMargin::new(client.clone()), lookback)),
            shares: FallbackChain::new("issued-shares").then(CachedSource::new(
                OfficialShares::new(client.clone()),
                shares_cache,
                SHARES_CACHE_KEY,
            )),
            history: Arc::new(YahooClient::new(client, &config.fetch)),
            history_cache: Some(history_cache),
        })
    }
}

// ============================================================================
// Run state
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub date: NaiveDate,
    /// Where the previous-period performance summary lives (or is regenerated to)
    pub summary_path: PathBuf,
}

/// Per-run lookups shared by the stages
#[derive(Debug, Default)]
pub struct RunContext {
    pub universe: Universe,
    pub ratios: RatioResolution,
    /// Issued shares by symbol
    pub shares: HashMap<String, f64>,
    pub invalid_tickers: Vec<String>,
}

#[derive(Debug)]
pub struct RunReport {
    pub date: NaiveDate,
    pub regime: Regime,
    pub weights: WeightOutcome,
    /// Ranked, best first
    pub records: Vec<SecurityRecord>,
    pub invalid_tickers: Vec<String>,
    pub universe_size: usize,
    pub candidates: usize,
    pub ratio_sources: HashMap<Market, Option<String>>,
}

// ============================================================================
// Pure stages
// ============================================================================

/// Indicators plus ratio, pressure, turnover and traded value for every key
/// with a usable history. Keys are visited in sorted order.
pub fn build_candidates(
    histories: &HashMap<SecurityKey, Vec<Bar>>,
    ctx: &RunContext,
    config: &IndicatorConfig,
) -> Vec<Candidate> {
    let mut keys: Vec<&SecurityKey> = histories.keys().collect();
    keys.sort();

    let candidates: Vec<Candidate> = keys
        .into_iter()
        .filter_map(|key| {
            let indicators = compute_indicators(&histories[key], config)?;
            let status = ctx.ratios.status(key);
            let ratio = ctx.ratios.ratio(key);
            let pressure = squeeze_pressure(status, ratio, &indicators);
            let turnover_pct = ctx
                .shares
                .get(&key.symbol)
                .filter(|s| **s > 0.0)
                .map(|s| indicators.last_volume / s * 100.0);
            let traded_value =
                Some(indicators.close * indicators.last_volume).filter(|v| v.is_finite());
            Some(Candidate {
                key: key.clone(),
                name: ctx.universe.name(key).map(str::to_string),
                indicators,
                ratio,
                ratio_status: status,
                squeeze_pressure: pressure,
                turnover_pct,
                traded_value,
            })
        })
        .collect();

    info!(
        with_history = histories.len(),
        candidates = candidates.len(),
        "Indicators computed"
    );
    candidates
}

/// Candidates with a strategy; the rest are dropped
pub fn classify_candidates(
    candidates: Vec<Candidate>,
    config: &ClassifierConfig,
) -> Vec<(Candidate, StrategyLabel)> {
    candidates
        .into_iter()
        .filter_map(|c| {
            let label = classify(
                &ClassifierInput {
                    market: c.key.market,
                    indicators: &c.indicators,
                    ratio: c.ratio,
                    squeeze_pressure: c.squeeze_pressure,
                },
                config,
            )?;
            Some((c, label))
        })
        .collect()
}

/// Distinct strategy labels present today
pub fn active_strategies(classified: &[(Candidate, StrategyLabel)]) -> Vec<String> {
    classified
        .iter()
        .map(|(_, s)| *s)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|s| s.label().to_string())
        .collect()
}

struct Draft {
    candidate: Candidate,
    strategy: StrategyLabel,
    weight: f64,
    strategy_score: f64,
    target: Decimal,
    notes: Vec<String>,
}

/// Score, size and gate the classified candidates, then rank them
pub fn assemble_records(
    classified: Vec<(Candidate, StrategyLabel)>,
    weights: &WeightOutcome,
    regime: Regime,
    config: &ScreenerConfig,
) -> Vec<SecurityRecord> {
    let mult = regime_multiplier(regime, &config.regime);
    let ratio_cfg = &config.ratio;

    let drafts: Vec<Draft> = classified
        .into_iter()
        .map(|(candidate, strategy)| {
            let weight = weights.weight(strategy.label());
            let mut notes = Vec::new();
            let mut strategy_score = weight;
            if let Some(r) = candidate.ratio.filter(|_| candidate.ratio_status.is_ok()) {
                if r >= ratio_cfg.penalty_ratio {
                    strategy_score -= ratio_cfg.penalty;
                    notes.push(format!(
                        "short/margin ratio >= {:.0}: strategy score -{:.1}",
                        ratio_cfg.penalty_ratio, ratio_cfg.penalty
                    ));
                }
            }
            let ind = &candidate.indicators;
            let target = position_size(weight, ind.atr20, ind.close, mult, &config.capital);
            Draft {
                candidate,
                strategy,
                weight,
                strategy_score,
                target,
                notes,
            }
        })
        .collect();

    let inputs: Vec<ScoreInput> = drafts
        .iter()
        .map(|d| {
            let c = &d.candidate;
            ScoreInput {
                target_position: d.target.to_f64().unwrap_or(0.0),
                strategy_score: d.strategy_score,
                abs_bias: Some(c.indicators.bias_pct.abs()).filter(|b| b.is_finite()),
                turnover_pct: c.turnover_pct,
                traded_value: c.traded_value,
                price: Some(c.indicators.close),
                annual_vol: c.indicators.annual_vol,
            }
        })
        .collect();
    let scores = composite_scores(&inputs, &config.scoring);
    let value_ranks =
        traded_value_ranks(&drafts.iter().map(|d| d.candidate.traded_value).collect::<Vec<_>>());

    let gate = LiquidityGate::new(&config.liquidity);
    let capital = config.capital.total_capital;
    let high_risk_line = Decimal::from_f64(config.capital.high_risk_share)
        .map(|share| capital * share)
        .unwrap_or(capital);

    let mut records: Vec<SecurityRecord> = drafts
        .into_iter()
        .zip(scores)
        .zip(value_ranks)
        .map(|((draft, score), value_rank)| {
            let Draft {
                candidate: c,
                strategy,
                weight,
                strategy_score,
                target,
                mut notes,
            } = draft;
            let ind = &c.indicators;

            let ratio_block = if !c.ratio_status.is_ok() {
                Some(format!("ratio {}: blocked (position=0)", c.ratio_status.label()))
            } else {
                c.ratio
                    .filter(|r| *r >= ratio_cfg.block_ratio)
                    .map(|r| format!("short/margin ratio {:.2} >= {:.0}: blocked (position=0)", r, ratio_cfg.block_ratio))
            };

            let decision = gate.decide(&GateInput {
                price: ind.close,
                turnover_pct: c.turnover_pct,
                traded_value: c.traded_value,
                annual_vol: ind.annual_vol,
            });
            let (gated, gate_notes) = gate.apply(target, &decision);
            notes.extend(gate_notes);

            let position = match ratio_block {
                Some(note) => {
                    notes.push(note);
                    Decimal::ZERO
                }
                None => gated,
            };
            if position > high_risk_line {
                notes.push(format!(
                    "HIGH RISK: position > {:.0}% of capital",
                    config.capital.high_risk_share * 100.0
                ));
            }

            let stop_loss = if ind.support.is_finite() && ind.support > 0.0 {
                ind.support
            } else {
                ind.close * STOP_LOSS_FALLBACK
            };

            SecurityRecord {
                lights: Lights {
                    turnover: turnover_light(c.turnover_pct, &config.scoring),
                    squeeze_pressure: pressure_light(c.squeeze_pressure, &config.scoring),
                    traded_value_rank: traded_value_rank_light(value_rank, &config.scoring),
                },
                stop_loss,
                key: c.key,
                name: c.name,
                indicators: c.indicators,
                ratio: c.ratio,
                ratio_status: c.ratio_status,
                squeeze_pressure: c.squeeze_pressure,
                turnover_pct: c.turnover_pct,
                traded_value: c.traded_value,
                traded_value_rank: value_rank,
                strategy,
                strategy_weight: weight,
                strategy_score,
                composite_score: score.composite,
                liquidity_penalty: score.penalty,
                target_position: target,
                position_size: position,
                annotations: notes,
            }
        })
        .collect();

    records.sort_by(|a, b| {
        b.composite_score
            .total_cmp(&a.composite_score)
            .then_with(|| a.indicators.bias_pct.total_cmp(&b.indicators.bias_pct))
            .then_with(|| a.key.cmp(&b.key))
    });
    records
}

// ============================================================================
// Run
// ============================================================================

/// Regime from the index history; RANGE when it cannot be fetched
pub async fn market_regime(loader: &HistoryLoader<'_>, config: &ScreenerConfig) -> Regime {
    let ticker = &config.regime.index_ticker;
    match loader.load_ticker(ticker, HistoryRange::SixMonths).await {
        (Some(bars), _) => {
            let regime = classify_regime(&bars, &config.regime);
            info!(index = %ticker, bars = bars.len(), regime = %regime, "Market regime");
            regime
        }
        (None, _) => {
            warn!(index = %ticker, "No index history, assuming RANGE");
            Regime::Range
        }
    }
}

/// Run the whole daily screen. `db` provides the weight prior and the
/// closed-trade history; without it the run uses no prior and the summary
/// file alone.
pub async fn run_daily(
    sources: &Sources,
    config: &ScreenerConfig,
    options: &RunOptions,
    db: Option<&Database>,
) -> EngineResult<RunReport> {
    let date = options.date;
    info!(%date, "Daily run starting");

    let universe = build_universe(&sources.primary_universe, &sources.secondary_universe, date).await;
    if universe.is_empty() {
        return Err(EngineError::EmptyUniverse);
    }

    let ratios = resolve_ratios(&sources.primary_margin, &sources.secondary_margin, date).await;
    let shares = sources
        .shares
        .resolve(date, |m| !m.is_empty())
        .await
        .data
        .unwrap_or_default();
    if shares.is_empty() {
        warn!("No issued-shares data, turnover unavailable for every security");
    }

    let mut ctx = RunContext {
        universe,
        ratios,
        shares,
        invalid_tickers: Vec::new(),
    };

    let mut loader = HistoryLoader::new(sources.history.as_ref(), &config.fetch);
    if let Some(cache) = &sources.history_cache {
        loader = loader.with_cache(cache);
    }
    let regime = market_regime(&loader, config).await;

    let batch = load_histories(
        &loader,
        &ctx.universe.keys,
        config.fetch.two_stage,
        config.indicators.min_avg_volume,
        config.fetch.prefilter_top_n,
    )
    .await;
    ctx.invalid_tickers = batch.invalid;

    let candidates = build_candidates(&batch.bars, &ctx, &config.indicators);
    let candidate_count = candidates.len();
    let classified = classify_candidates(candidates, &config.classifier);
    let active = active_strategies(&classified);
    info!(classified = classified.len(), strategies = ?active, "Candidates classified");

    let performance = resolve_performance(&options.summary_path, db.map(|d| d.pool())).await;
    let prior = match db {
        Some(d) => match WeightStateRepository::new(d.pool()).load().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Failed to read weight state, continuing without a prior");
                None
            }
        },
        None => None,
    };
    let weights = compute_weights(&active, performance.as_ref(), prior.as_ref(), &config.weights);
    info!(mode = %weights.mode, weights = ?weights.weights, "Strategy weights");

    let records = assemble_records(classified, &weights, regime, config);
    let blocked = records.iter().filter(|r| r.position_size.is_zero()).count();
    info!(records = records.len(), blocked, regime = %regime, "Daily run complete");

    Ok(RunReport {
        date,
        regime,
        weights,
        records,
        invalid_tickers: ctx.invalid_tickers,
        universe_size: ctx.universe.len(),
        candidates: candidate_count,
        ratio_sources: ctx.ratios.sources,
    })
}

/// Write the weight state (unless the weights are the equal fallback) and
/// the ranked snapshot. Returns the number of snapshot rows stored.
pub async fn persist_report(db: &Database, report: &RunReport) -> EngineResult<usize> {
    let run_date = report.date.to_string();

    if report.weights.should_persist() {
        WeightStateRepository::new(db.pool())
            .save(&run_date, &report.weights.weights)
            .await?;
        debug!(strategies = report.weights.weights.len(), "Weight state saved");
    } else {
        info!(mode = %report.weights.mode, "Weight state not updated");
    }

    let rows = report
        .records
        .iter()
        .map(|r| {
            Ok(NewSnapshotRow {
                symbol: r.key.symbol.clone(),
                market: r.key.market.label().to_string(),
                name: r.name.clone(),
                strategy: r.strategy.label().to_string(),
                composite_score: r.composite_score,
                position_size: r.position_size.to_string(),
                ratio: r.ratio,
                ratio_status: r.ratio_status.label().to_string(),
                record_json: serde_json::to_string(r)?,
            })
        })
        .collect::<EngineResult<Vec<_>>>()?;
    let stored = SnapshotRepository::new(db.pool())
        .save_run(&run_date, report.regime.label(), &rows)
        .await?;
    info!(run_date = %run_date, stored, "Snapshot saved");
    Ok(stored)
}
