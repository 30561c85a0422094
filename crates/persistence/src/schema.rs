//! Database schema definitions

/// SQL to create all tables
/// NOTE: position sizes are stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Strategy weights used by the last run (prior state for smoothing)
CREATE TABLE IF NOT EXISTS strategy_weight_state (
    strategy TEXT PRIMARY KEY,
    weight REAL NOT NULL,
    updated_on TEXT NOT NULL
);

-- Realized trades, source for performance summary regeneration
CREATE TABLE IF NOT EXISTS closed_trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_hash TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    market TEXT NOT NULL,
    strategy TEXT NOT NULL,
    entry_date TEXT NOT NULL,
    exit_date TEXT NOT NULL,
    entry_price REAL NOT NULL,
    exit_price REAL NOT NULL,
    pnl_pct REAL NOT NULL,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Ranked rows of each daily run
CREATE TABLE IF NOT EXISTS run_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    row_hash TEXT NOT NULL UNIQUE,
    run_date TEXT NOT NULL,
    rank INTEGER NOT NULL,
    symbol TEXT NOT NULL,
    market TEXT NOT NULL,
    name TEXT,
    strategy TEXT NOT NULL,
    composite_score REAL NOT NULL DEFAULT 0,
    position_size TEXT NOT NULL DEFAULT '0',
    ratio REAL,
    ratio_status TEXT NOT NULL,
    record_json TEXT NOT NULL,
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_closed_trades_strategy ON closed_trades(strategy, exit_date);
CREATE INDEX IF NOT EXISTS idx_run_snapshots_date ON run_snapshots(run_date, rank)
"#;

/// ALTER TABLE statements for databases created by earlier versions
pub const MIGRATIONS: &[&str] = &["ALTER TABLE run_snapshots ADD COLUMN regime TEXT"];
