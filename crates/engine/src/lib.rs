//! Squeeze Screener Engine — adaptive signal scoring and weighting
//!
//! Daily screen of the listed (TWSE) and OTC (TPEx) boards:
//! - Short/margin ratio resolution over prioritized fallback sources
//! - Indicator normalization and single-pass strategy classification
//! - Performance-driven strategy weights with smoothing and a per-strategy cap
//! - Percentile composite scoring, volatility-based sizing and a liquidity gate
//! - Ranked CSV / weight-trace exports

pub mod api;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod error;
pub mod export;
pub mod history;
pub mod indicators;
pub mod performance;
pub mod pipeline;
pub mod ratio;
pub mod schema;
pub mod scorer;
pub mod sizing;
pub mod sources;
pub mod types;
pub mod universe;
pub mod weights;

// Re-exports for convenience
pub use config::ScreenerConfig;
pub use error::{EngineError, EngineResult};
pub use export::{write_run_outputs, RunFiles};
pub use performance::{import_closed_trades, resolve_performance};
pub use pipeline::{persist_report, run_daily, RunOptions, RunReport, Sources};
pub use sources::{FallbackChain, FetchOutcome, HistoryProvider, Source};
pub use types::*;
pub use weights::{compute_weights, WeightMode, WeightOutcome};
