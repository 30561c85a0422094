//! Source abstractions and the fallback chain
//!
//! Every upstream endpoint is a [`Source`] returning a tagged
//! [`FetchOutcome`]. Failures never escape a source: they become
//! `Unavailable` and the chain moves on to the next source in priority order.

use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Weekday};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::types::Bar;

const WALK_BACK_PAUSE_MS: u64 = 300;

/// Result of one attempt against one source
#[derive(Debug, Clone)]
pub enum FetchOutcome<T> {
    Success(T),
    Unavailable(String),
}

impl<T> FetchOutcome<T> {
    pub fn success(self) -> Option<T> {
        match self {
            FetchOutcome::Success(v) => Some(v),
            FetchOutcome::Unavailable(_) => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }
}

impl<T> From<EngineResult<T>> for FetchOutcome<T> {
    fn from(result: EngineResult<T>) -> Self {
        match result {
            Ok(v) => FetchOutcome::Success(v),
            Err(e) => FetchOutcome::Unavailable(e.to_string()),
        }
    }
}

/// An endpoint that can be asked for data "as of" a target date
#[async_trait]
pub trait Source<T>: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch(&self, target: NaiveDate) -> FetchOutcome<T>;
}

/// An endpoint that only answers for one specific trading date
#[async_trait]
pub trait DatedSource<T>: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_on(&self, date: NaiveDate) -> FetchOutcome<T>;
}

// ============================================================================
// Walk-back adapter
// ============================================================================

/// Turns a [`DatedSource`] into a [`Source`] by walking backward from the
/// target date, weekends skipped, until a day yields a non-empty result.
pub struct WalkBack<S> {
    inner: S,
    lookback_days: u32,
    pause: Duration,
}

impl<S> WalkBack<S> {
    pub fn new(inner: S, lookback_days: u32) -> Self {
        Self {
            inner,
            lookback_days,
            pause: Duration::from_millis(WALK_BACK_PAUSE_MS),
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }
}

fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

#[async_trait]
impl<R, S> Source<Vec<R>> for WalkBack<S>
where
    R: Send + 'static,
    S: DatedSource<Vec<R>>,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn fetch(&self, target: NaiveDate) -> FetchOutcome<Vec<R>> {
        let mut last_reason = String::from("no trading day in lookback window");
        for back in 0..=self.lookback_days {
            let date = target - ChronoDuration::days(back as i64);
            if is_weekend(date) {
                continue;
            }
            match self.inner.fetch_on(date).await {
                FetchOutcome::Success(rows) if !rows.is_empty() => {
                    debug!(source = self.inner.name(), %date, rows = rows.len(), "Walk-back hit");
                    return FetchOutcome::Success(rows);
                }
                FetchOutcome::Success(_) => last_reason = format!("{} empty", date),
                FetchOutcome::Unavailable(reason) => last_reason = reason,
            }
            if !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }
        FetchOutcome::Unavailable(format!(
            "{}: nothing within {} days ({})",
            self.inner.name(),
            self.lookback_days,
            last_reason
        ))
    }
}

// ============================================================================
// Fallback chain
// ============================================================================

/// Result of running a chain: the winning source (if any) and its data
#[derive(Debug)]
pub struct ChainOutcome<T> {
    pub source: Option<String>,
    pub data: Option<T>,
    /// (source, reason) of every rejected attempt, in order
    pub rejected: Vec<(String, String)>,
}

/// Sources evaluated in priority order; the first usable result wins
pub struct FallbackChain<T> {
    label: String,
    sources: Vec<Box<dyn Source<T>>>,
}

impl<T: Send> FallbackChain<T> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            sources: Vec::new(),
        }
    }

    pub fn then(mut self, source: impl Source<T> + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Try each source in order until `usable` accepts a result
    pub async fn resolve<F>(&self, target: NaiveDate, usable: F) -> ChainOutcome<T>
    where
        F: Fn(&T) -> bool,
    {
        let mut rejected = Vec::new();
        for source in &self.sources {
            match source.fetch(target).await {
                FetchOutcome::Success(data) if usable(&data) => {
                    info!(chain = %self.label, source = source.name(), "Source accepted");
                    return ChainOutcome {
                        source: Some(source.name().to_string()),
                        data: Some(data),
                        rejected,
                    };
                }
                FetchOutcome::Success(_) => {
                    warn!(chain = %self.label, source = source.name(), "Source returned no usable rows, falling back");
                    rejected.push((source.name().to_string(), "no usable rows".to_string()));
                }
                FetchOutcome::Unavailable(reason) => {
                    warn!(chain = %self.label, source = source.name(), reason = %reason, "Source unavailable, falling back");
                    rejected.push((source.name().to_string(), reason));
                }
            }
        }
        warn!(chain = %self.label, "Every source failed");
        ChainOutcome {
            source: None,
            data: None,
            rejected,
        }
    }
}

// ============================================================================
// History provider
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRange {
    FiveDays,
    SixMonths,
}

impl HistoryRange {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryRange::FiveDays => "5d",
            HistoryRange::SixMonths => "6mo",
        }
    }
}

/// Per-ticker daily history. No data is `Unavailable`; rate-limit handling
/// happens inside the implementation.
#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn history(&self, ticker: &str, range: HistoryRange) -> FetchOutcome<Vec<Bar>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Fixed {
        name: &'static str,
        outcome: FetchOutcome<Vec<u32>>,
    }

    #[async_trait]
    impl Source<Vec<u32>> for Fixed {
        fn name(&self) -> &str {
            self.name
        }
        async fn fetch(&self, _target: NaiveDate) -> FetchOutcome<Vec<u32>> {
            self.outcome.clone()
        }
    }

    /// Returns data only on `hit`, records every date asked
    struct OnlyOn {
        hit: NaiveDate,
        asked: Mutex<Vec<NaiveDate>>,
    }

    #[async_trait]
    impl DatedSource<Vec<u32>> for OnlyOn {
        fn name(&self) -> &str {
            "only-on"
        }
        async fn fetch_on(&self, date: NaiveDate) -> FetchOutcome<Vec<u32>> {
            self.asked.lock().unwrap().push(date);
            if date == self.hit {
                FetchOutcome::Success(vec![1, 2])
            } else {
                FetchOutcome::Success(vec![])
            }
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_chain_falls_through_empty_and_unavailable() {
        let chain = FallbackChain::new("test")
            .then(Fixed { name: "empty", outcome: FetchOutcome::Success(vec![]) })
            .then(Fixed { name: "down", outcome: FetchOutcome::Unavailable("timeout".into()) })
            .then(Fixed { name: "good", outcome: FetchOutcome::Success(vec![7]) });

        let out = chain.resolve(day(2024, 5, 2), |v| !v.is_empty()).await;
        assert_eq!(out.source.as_deref(), Some("good"));
        assert_eq!(out.data, Some(vec![7]));
        assert_eq!(out.rejected.len(), 2);
    }

    #[tokio::test]
    async fn test_chain_all_fail() {
        let chain = FallbackChain::new("test")
            .then(Fixed { name: "down", outcome: FetchOutcome::Unavailable("boom".into()) });
        let out = chain.resolve(day(2024, 5, 2), |v| !v.is_empty()).await;
        assert!(out.source.is_none());
        assert!(out.data.is_none());
    }

    #[tokio::test]
    async fn test_walk_back_skips_weekends_and_stops_at_first_hit() {
        // 2024-05-06 is a Monday; the hit is the previous Thursday
        let inner = OnlyOn { hit: day(2024, 5, 2), asked: Mutex::new(Vec::new()) };
        let walker = WalkBack::new(inner, 30).with_pause(Duration::ZERO);

        let out = walker.fetch(day(2024, 5, 6)).await;
        assert_eq!(out.success(), Some(vec![1, 2]));

        let asked = walker.inner.asked.lock().unwrap().clone();
        assert_eq!(asked, vec![day(2024, 5, 6), day(2024, 5, 3), day(2024, 5, 2)]);
    }

    #[tokio::test]
    async fn test_walk_back_gives_up_after_lookback() {
        let inner = OnlyOn { hit: day(2023, 1, 2), asked: Mutex::new(Vec::new()) };
        let walker = WalkBack::new(inner, 5).with_pause(Duration::ZERO);
        assert!(!walker.fetch(day(2024, 5, 6)).await.is_success());
    }
}
