//! Engine error type

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    // --- Upstream sources ---
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{source_name} returned HTTP {status}")]
    Status { source_name: String, status: u16 },

    #[error("rate limited by {0}")]
    RateLimited(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("universe is empty: every reference source failed")]
    EmptyUniverse,

    // --- Local ---
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Db(#[from] persistence::DbError),
}

pub type EngineResult<T> = Result<T, EngineError>;
