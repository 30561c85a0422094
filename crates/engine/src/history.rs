//! Batched history acquisition
//!
//! Tickers are fetched in fixed-size batches with a pause between batches.
//! Tickers with no data are collected rather than failing the run. An
//! optional first stage fetches five days for the whole universe and keeps
//! only the most liquid names for the six-month fetch.

use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::FileCache;
use crate::config::FetchConfig;
use crate::sources::{FetchOutcome, HistoryProvider, HistoryRange};
use crate::types::{Bar, SecurityKey};

#[derive(Debug, Default)]
pub struct HistoryBatch {
    pub bars: HashMap<SecurityKey, Vec<Bar>>,
    /// Tickers that returned no data, in request order
    pub invalid: Vec<String>,
}

pub struct HistoryLoader<'a> {
    provider: &'a dyn HistoryProvider,
    cache: Option<&'a FileCache>,
    batch_size: usize,
    batch_pause: Duration,
}

impl<'a> HistoryLoader<'a> {
    pub fn new(provider: &'a dyn HistoryProvider, config: &FetchConfig) -> Self {
        Self {
            provider,
            cache: None,
            batch_size: config.batch_size.max(1),
            batch_pause: Duration::from_millis(config.batch_sleep_ms),
        }
    }

    pub fn with_cache(mut self, cache: &'a FileCache) -> Self {
        self.cache = Some(cache);
        self
    }

    fn cache_key(ticker: &str, range: HistoryRange) -> String {
        format!("{}_{}", ticker, range.as_str())
    }

    /// One ticker through the cache. `None` when the provider has nothing.
    /// The flag reports whether the network was used.
    pub async fn load_ticker(&self, ticker: &str, range: HistoryRange) -> (Option<Vec<Bar>>, bool) {
        let key = Self::cache_key(ticker, range);
        if let Some(bars) = self.cache.and_then(|c| c.get::<Vec<Bar>>(&key)) {
            if !bars.is_empty() {
                return (Some(bars), false);
            }
        }
        match self.provider.history(ticker, range).await {
            FetchOutcome::Success(bars) if !bars.is_empty() => {
                if let Some(cache) = self.cache {
                    if let Err(e) = cache.put(&key, &bars) {
                        debug!(ticker, error = %e, "History cache write failed");
                    }
                }
                (Some(bars), true)
            }
            FetchOutcome::Success(_) => (None, true),
            FetchOutcome::Unavailable(reason) => {
                debug!(ticker, reason = %reason, "No history");
                (None, true)
            }
        }
    }

    pub async fn load(&self, keys: &[SecurityKey], range: HistoryRange) -> HistoryBatch {
        let mut batch = HistoryBatch::default();
        let total_batches = keys.len().div_ceil(self.batch_size);

        for (i, chunk) in keys.chunks(self.batch_size).enumerate() {
            let mut fetched = false;
            for key in chunk {
                let ticker = key.ticker();
                let (bars, used_network) = self.load_ticker(&ticker, range).await;
                fetched |= used_network;
                match bars {
                    Some(bars) => {
                        batch.bars.insert(key.clone(), bars);
                    }
                    None => batch.invalid.push(ticker),
                }
            }
            debug!(
                batch = i + 1,
                total = total_batches,
                range = range.as_str(),
                "History batch done"
            );
            if fetched && i + 1 < total_batches && !self.batch_pause.is_zero() {
                tokio::time::sleep(self.batch_pause).await;
            }
        }

        info!(
            range = range.as_str(),
            requested = keys.len(),
            loaded = batch.bars.len(),
            invalid = batch.invalid.len(),
            "History loaded"
        );
        batch
    }
}

fn mean_volume(bars: &[Bar]) -> Option<f64> {
    if bars.is_empty() {
        return None;
    }
    Some(bars.iter().map(|b| b.volume).sum::<f64>() / bars.len() as f64)
}

/// Keys whose mean volume clears `min_avg_volume`, most liquid first, at
/// most `top_n`. Empty when nobody qualifies.
pub fn prefilter(short: &HashMap<SecurityKey, Vec<Bar>>, min_avg_volume: f64, top_n: usize) -> Vec<SecurityKey> {
    let mut ranked: Vec<(SecurityKey, f64)> = short
        .iter()
        .filter_map(|(key, bars)| Some((key.clone(), mean_volume(bars)?)))
        .filter(|(_, v)| *v >= min_avg_volume)
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(top_n);
    ranked.into_iter().map(|(k, _)| k).collect()
}

/// Six-month histories, optionally behind the five-day liquidity prefilter
pub async fn load_histories(
    loader: &HistoryLoader<'_>,
    keys: &[SecurityKey],
    two_stage: bool,
    min_avg_volume: f64,
    top_n: usize,
) -> HistoryBatch {
    if !two_stage {
        return loader.load(keys, HistoryRange::SixMonths).await;
    }

    let stage_one = loader.load(keys, HistoryRange::FiveDays).await;
    let survivors = prefilter(&stage_one.bars, min_avg_volume, top_n);
    let stage_two_keys: Vec<SecurityKey> = if survivors.is_empty() {
        info!("No ticker cleared the prefilter, fetching the full universe");
        keys.to_vec()
    } else {
        info!(kept = survivors.len(), of = keys.len(), "Prefilter applied");
        survivors
    };

    let mut batch = loader.load(&stage_two_keys, HistoryRange::SixMonths).await;
    for ticker in stage_one.invalid {
        if !batch.invalid.contains(&ticker) {
            batch.invalid.push(ticker);
        }
    }
    batch
}
