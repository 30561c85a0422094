//! Yahoo Finance chart API: daily OHLCV per ticker, public, no key

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::http::{get_text, looks_rate_limited, retry_rate_limited};
use crate::config::FetchConfig;
use crate::error::{EngineError, EngineResult};
use crate::sources::{FetchOutcome, HistoryProvider, HistoryRange};
use crate::types::Bar;

const BASE_URL: &str = "https://query1.finance.yahoo.com/v8/finance/chart";

// ---------------------------------------------------------------------------
// Deserialization structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: Option<ChartMeta>,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: i64,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Parse a chart payload into bars. Bars with any null field are skipped;
/// dates are exchange-local via the reported GMT offset.
pub fn parse_chart(body: &str) -> EngineResult<Vec<Bar>> {
    let response: ChartResponse = serde_json::from_str(body)?;
    if let Some(err) = response.chart.error {
        return Err(EngineError::Parse(format!(
            "yahoo: {} ({})",
            err.code.unwrap_or_default(),
            err.description.unwrap_or_default()
        )));
    }
    let Some(result) = response.chart.result.and_then(|r| r.into_iter().next()) else {
        return Ok(Vec::new());
    };
    let offset = result.meta.map(|m| m.gmtoffset).unwrap_or(0);
    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();

    let mut bars: Vec<Bar> = result
        .timestamp
        .iter()
        .enumerate()
        .filter_map(|(i, ts)| {
            let date: NaiveDate = DateTime::from_timestamp(ts + offset, 0)?.date_naive();
            Some(Bar {
                date,
                open: (*quote.open.get(i)?)?,
                high: (*quote.high.get(i)?)?,
                low: (*quote.low.get(i)?)?,
                close: (*quote.close.get(i)?)?,
                volume: (*quote.volume.get(i)?)?,
            })
        })
        .collect();
    // the live bar can repeat the last session's date
    bars.dedup_by(|later, earlier| later.date == earlier.date);
    Ok(bars)
}

// ---------------------------------------------------------------------------
// Client implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct YahooClient {
    client: Client,
    max_retries: u32,
    backoff_base_secs: f64,
}

impl YahooClient {
    pub fn new(client: Client, config: &FetchConfig) -> Self {
        Self {
            client,
            max_retries: config.max_retries,
            backoff_base_secs: config.backoff_base_secs,
        }
    }

    async fn fetch_once(&self, ticker: &str, range: HistoryRange) -> EngineResult<Vec<Bar>> {
        let url = format!(
            "{}/{}?range={}&interval=1d&includePrePost=false",
            BASE_URL,
            ticker,
            range.as_str()
        );
        let body = get_text(&self.client, "yahoo", &url, None).await?;
        if looks_rate_limited(&body) {
            return Err(EngineError::RateLimited("yahoo".into()));
        }
        parse_chart(&body)
    }
}

#[async_trait]
impl HistoryProvider for YahooClient {
    async fn history(&self, ticker: &str, range: HistoryRange) -> FetchOutcome<Vec<Bar>> {
        let result = retry_rate_limited(ticker, self.max_retries, self.backoff_base_secs, move || {
            self.fetch_once(ticker, range)
        })
        .await;
        match result {
            Ok(bars) if bars.is_empty() => FetchOutcome::Unavailable(format!("{}: no data", ticker)),
            Ok(bars) => {
                debug!(ticker, bars = bars.len(), range = range.as_str(), "History fetched");
                FetchOutcome::Success(bars)
            }
            Err(e) => FetchOutcome::Unavailable(e.to_string()),
        }
    }
}
