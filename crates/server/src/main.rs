//! Squeeze Screener — daily short-squeeze / mean-revert screen of TWSE and TPEx
//!
//! Usage:
//!   squeeze-screener run --date 2024-05-02       Run the daily screen
//!   squeeze-screener weights                     Show the persisted weight state
//!   squeeze-screener import-trades --file x.csv  Load closed trades
//!   squeeze-screener serve --port 3001           Read-only API over past runs

use axum::{
    extract::{Path as UrlPath, Query, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use engine::{
    import_closed_trades, persist_report, run_daily, write_run_outputs, RunOptions, ScreenerConfig,
    Sources,
};
use persistence::repository::{SnapshotRecord, SnapshotRepository, WeightStateRepository};
use persistence::Database;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "squeeze-screener")]
#[command(about = "Adaptive signal scoring and weighting for the TWSE/TPEx daily screen", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daily screen and write the ranked outputs
    Run {
        /// Target date (YYYY-MM-DD), today by default
        #[arg(long)]
        date: Option<NaiveDate>,
        /// JSON config file overriding the defaults
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output directory (default: $SCREENER_OUT_DIR or ./output)
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Rows in the top-N export (default from config)
        #[arg(long)]
        top_n: Option<usize>,
        /// Skip writing weight state and the run snapshot
        #[arg(long)]
        no_persist: bool,
        /// Fetch six-month histories for the whole universe, no five-day prefilter
        #[arg(long)]
        single_stage: bool,
    },
    /// Print the persisted strategy weight state
    Weights,
    /// Load a closed-trade CSV into the trade history
    ImportTrades {
        #[arg(long)]
        file: PathBuf,
    },
    /// Launch the read-only API
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
    },
}

#[derive(Clone)]
struct AppState {
    db: Arc<Database>,
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn run_stamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Console layer plus a per-run plain-text file under `log_dir`.
/// The returned guard flushes the file writer on drop.
fn init_logging(verbose: bool, log_dir: &Path) -> anyhow::Result<WorkerGuard> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    std::fs::create_dir_all(log_dir)?;
    let file_appender =
        tracing_appender::rolling::never(log_dir, format!("run_{}.log", run_stamp()));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug,engine=debug,persistence=debug,squeeze_screener=debug,hyper=info,reqwest=info,sqlx=warn")
        } else {
            EnvFilter::new("info,engine=info,squeeze_screener=info,sqlx=warn")
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).compact())
        .init();

    Ok(guard)
}

/// Cause chain and backtrace of a failed run, for post-mortem
fn write_fatal_log(log_dir: &Path, err: &anyhow::Error) -> std::io::Result<PathBuf> {
    let path = log_dir.join(format!("daily_run_error_{}.log", run_stamp()));
    let mut body = format!("squeeze-screener v{} run failed at {}\n\n", APP_VERSION, Local::now());
    body.push_str(&format!("error: {}\n", err));
    for (i, cause) in err.chain().skip(1).enumerate() {
        body.push_str(&format!("  caused by [{}]: {}\n", i, cause));
    }
    body.push_str(&format!("\nbacktrace:\n{}\n", err.backtrace()));
    std::fs::create_dir_all(log_dir)?;
    std::fs::write(&path, body)?;
    Ok(path)
}

async fn open_db() -> anyhow::Result<(Database, PathBuf)> {
    let db_path = env_path("SCREENER_DB_PATH", "data/screener.db");
    let db = Database::new(&db_path)
        .await
        .map_err(|e| anyhow::anyhow!("Database initialization failed: {}", e))?;
    Ok((db, db_path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    let log_dir = env_path("SCREENER_LOG_DIR", "logs");
    let _guard = init_logging(cli.verbose, &log_dir)?;

    match cli.command {
        Commands::Run {
            date,
            config,
            out_dir,
            top_n,
            no_persist,
            single_stage,
        } => {
            let args = RunArgs {
                date: date.unwrap_or_else(|| Local::now().date_naive()),
                config,
                out_dir: out_dir.unwrap_or_else(|| env_path("SCREENER_OUT_DIR", "output")),
                top_n,
                persist: !no_persist,
                single_stage,
            };
            if let Err(e) = cmd_run(args).await {
                error!(error = %e, "Daily run failed");
                match write_fatal_log(&log_dir, &e) {
                    Ok(path) => error!(path = %path.display(), "Error details written"),
                    Err(io) => error!(error = %io, "Failed to write error log"),
                }
                return Err(e);
            }
        }
        Commands::Weights => cmd_weights().await?,
        Commands::ImportTrades { file } => cmd_import_trades(&file).await?,
        Commands::Serve { host, port } => cmd_serve(&host, port).await?,
    }

    Ok(())
}

// ============================================================================
// Run command
// ============================================================================

struct RunArgs {
    date: NaiveDate,
    config: Option<PathBuf>,
    out_dir: PathBuf,
    top_n: Option<usize>,
    persist: bool,
    single_stage: bool,
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    println!("\n=== Squeeze Screener v{} ===", APP_VERSION);

    let mut config = ScreenerConfig::load(args.config.as_deref())?;
    if args.single_stage {
        config.fetch.two_stage = false;
    }
    let top_n = args.top_n.unwrap_or(config.scoring.top_n);
    let cache_dir = env_path("SCREENER_CACHE_DIR", "cache");

    // The run goes on without a database: no prior, summary file only
    let db = match open_db().await {
        Ok((db, path)) => {
            info!(path = %path.display(), "Database initialized");
            Some(db)
        }
        Err(e) => {
            warn!(error = %e, "Database unavailable, running without persisted state");
            None
        }
    };

    println!(
        "Date: {} | Capital: {} | Two-stage: {} | Top N: {}",
        args.date, config.capital.total_capital, config.fetch.two_stage, top_n
    );
    println!();

    let sources = Sources::live(&config, &cache_dir)?;
    let options = RunOptions {
        date: args.date,
        summary_path: args.out_dir.join("performance_summary.csv"),
    };
    let report = run_daily(&sources, &config, &options, db.as_ref()).await?;

    let files = write_run_outputs(
        &args.out_dir,
        report.date,
        report.regime,
        &report.records,
        &report.weights,
        &report.invalid_tickers,
        top_n,
    )?;

    match (&db, args.persist) {
        (Some(db), true) => {
            persist_report(db, &report).await?;
        }
        (None, true) => warn!("No database, weight state and snapshot not saved"),
        (_, false) => info!("Persistence disabled for this run"),
    }

    println!("Regime: {} | Weight mode: {}", report.regime, report.weights.mode);
    for (strategy, weight) in &report.weights.weights {
        println!("  {:<26} {:>6.2}%", strategy, weight * 100.0);
    }
    println!(
        "\nUniverse: {} | Candidates: {} | Ranked: {} | Invalid tickers: {}",
        report.universe_size,
        report.candidates,
        report.records.len(),
        report.invalid_tickers.len()
    );
    println!("\n{:<4} {:<10} {:<26} {:>8} {:>10}  Notes", "#", "Ticker", "Strategy", "Score", "Position");
    for (i, r) in report.records.iter().take(top_n).enumerate() {
        println!(
            "{:<4} {:<10} {:<26} {:>8.4} {:>10}  {}",
            i + 1,
            r.key.ticker(),
            r.strategy.label(),
            r.composite_score,
            r.position_size,
            r.risk_note()
        );
    }
    println!("\nOutputs:");
    println!("  {}", files.ranked.display());
    println!("  {}", files.top.display());
    println!("  {}", files.weight_trace.display());
    println!("  {}", files.invalid_tickers.display());
    Ok(())
}

// ============================================================================
// Weights / import commands
// ============================================================================

async fn cmd_weights() -> anyhow::Result<()> {
    let (db, db_path) = open_db().await?;
    match WeightStateRepository::new(db.pool()).load().await? {
        Some(state) => {
            println!("Weight state ({}), updated {}", db_path.display(), state.updated_on);
            for (strategy, weight) in &state.weights {
                println!("  {:<26} {:>8.4}", strategy, weight);
            }
        }
        None => println!("No weight state saved yet ({})", db_path.display()),
    }
    Ok(())
}

async fn cmd_import_trades(file: &Path) -> anyhow::Result<()> {
    let (db, db_path) = open_db().await?;
    let (parsed, inserted) = import_closed_trades(db.pool(), file).await?;
    println!(
        "Imported {} new closed trades ({} parsed, {} already present) into {}",
        inserted,
        parsed,
        parsed - inserted,
        db_path.display()
    );
    Ok(())
}

// ============================================================================
// Serve command (read-only API)
// ============================================================================

async fn cmd_serve(host: &str, port: u16) -> anyhow::Result<()> {
    info!("Squeeze Screener v{} starting...", APP_VERSION);

    let (db, db_path) = open_db().await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        e
    })?;
    info!(path = %db_path.display(), "Database initialized");

    let state = AppState { db: Arc::new(db) };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/weights", get(api_weights))
        .route("/snapshots/latest", get(api_latest_snapshot))
        .route("/snapshots/:date", get(api_snapshot))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Squeeze Screener v{} ===", APP_VERSION);
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET  /api/health              - Health check");
    println!("  GET  /api/weights             - Persisted strategy weights");
    println!("  GET  /api/snapshots/latest    - Ranked rows of the latest run");
    println!("  GET  /api/snapshots/:date     - Ranked rows of one run (YYYY-MM-DD)");
    println!("\n  Database: {}", db_path.display());
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "squeeze-screener",
        "version": APP_VERSION,
    }))
}

/// GET /api/weights: weight state written by the last dynamic run
async fn api_weights(State(state): State<AppState>) -> Json<serde_json::Value> {
    match WeightStateRepository::new(state.db.pool()).load().await {
        Ok(Some(stored)) => Json(serde_json::json!({
            "success": true,
            "updated_on": stored.updated_on,
            "weights": stored.weights,
        })),
        Ok(None) => Json(serde_json::json!({
            "success": true,
            "updated_on": null,
            "weights": {},
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": format!("Failed to load weight state: {}", e),
        })),
    }
}

fn snapshot_json(run_date: &str, rows: Vec<SnapshotRecord>, limit: Option<usize>) -> serde_json::Value {
    let total = rows.len();
    let rows: Vec<serde_json::Value> = rows
        .into_iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|r| {
            let record: serde_json::Value =
                serde_json::from_str(&r.record_json).unwrap_or(serde_json::Value::Null);
            serde_json::json!({
                "rank": r.rank,
                "symbol": r.symbol,
                "market": r.market,
                "name": r.name,
                "strategy": r.strategy,
                "composite_score": r.composite_score,
                "position_size": r.position_size,
                "ratio": r.ratio,
                "ratio_status": r.ratio_status,
                "regime": r.regime,
                "record": record,
            })
        })
        .collect();
    serde_json::json!({
        "success": true,
        "run_date": run_date,
        "total": total,
        "rows": rows,
    })
}

fn limit_param(params: &HashMap<String, String>) -> Option<usize> {
    params.get("limit").and_then(|s| s.parse().ok())
}

/// GET /api/snapshots/latest?limit=N
async fn api_latest_snapshot(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let repo = SnapshotRepository::new(state.db.pool());
    let run_date = repo.latest_run_date().await.map_err(|e| {
        error!(error = %e, "Failed to read latest run date");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let Some(run_date) = run_date else {
        return Err(StatusCode::NOT_FOUND);
    };
    let rows = repo.get_run(&run_date).await.map_err(|e| {
        error!(error = %e, "Failed to read snapshot");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(snapshot_json(&run_date, rows, limit_param(&params))))
}

/// GET /api/snapshots/:date?limit=N
async fn api_snapshot(
    State(state): State<AppState>,
    UrlPath(date): UrlPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let run_date = NaiveDate::parse_from_str(&date, "%Y-%m-%d")
        .map_err(|_| StatusCode::BAD_REQUEST)?
        .to_string();
    let rows = SnapshotRepository::new(state.db.pool())
        .get_run(&run_date)
        .await
        .map_err(|e| {
            error!(error = %e, run_date = %run_date, "Failed to read snapshot");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    if rows.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(snapshot_json(&run_date, rows, limit_param(&params))))
}
