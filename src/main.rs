use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use standings_engine::config::{EngineConfig, RetentionPolicy, ServerConfig, TableRules};
use standings_engine::controller::AutomationController;
use standings_engine::dashboard::{run_dashboard, DashboardState};
use standings_engine::shutdown::install_shutdown_handler;
use standings_engine::standings::{self, TableEntry, TableKey, TieBreakPolicy};
use standings_engine::storage::{JsonGameSource, MemoryStorage};

#[derive(Parser, Debug)]
#[command(name = "standings-engine")]
#[command(version)]
#[command(about = "League table automation engine")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the automation controller and the admin API
    Serve(ServeArgs),

    /// Compute one table from a games file and print it
    Compute(ComputeArgs),
}

// =============================================================================
// Serve Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServeArgs {
    /// Port for the admin API
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Address to bind the admin API to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// JSON file with games (and optional rosters)
    #[arg(long, default_value = "games.json")]
    games: PathBuf,

    /// Number of worker loops
    #[arg(long, default_value = "2")]
    concurrency: usize,

    /// Retries for transient failures before a job fails
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Wall-clock bound for one execution attempt
    #[arg(long, default_value = "30000")]
    job_timeout_ms: u64,

    /// Recompute every known table on this interval
    #[arg(long)]
    sweep_interval_secs: Option<u64>,

    /// Snapshots kept per table
    #[arg(long, default_value = "20")]
    keep_snapshots: usize,

    /// Start paused: triggers are queued but not processed until resumed
    #[arg(long)]
    paused: bool,
}

// =============================================================================
// Compute Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ComputeArgs {
    /// JSON file with games (and optional rosters)
    #[arg(long)]
    games: PathBuf,

    #[arg(long)]
    league: String,

    #[arg(long)]
    season: String,

    /// Tie-break after points, goal difference and goals for
    #[arg(long, value_enum, default_value = "head-to-head")]
    tie_break: TieBreakArg,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum TieBreakArg {
    Standard,
    HeadToHead,
}

impl From<TieBreakArg> for TieBreakPolicy {
    fn from(arg: TieBreakArg) -> Self {
        match arg {
            TieBreakArg::Standard => TieBreakPolicy::Standard,
            TieBreakArg::HeadToHead => TieBreakPolicy::HeadToHead,
        }
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct TableOutput<'a> {
    league: &'a str,
    season: &'a str,
    entries: &'a [TableEntry],
}

// =============================================================================
// Serve
// =============================================================================

async fn run_serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let engine = EngineConfig {
        queue_concurrency: args.concurrency,
        max_retries: args.max_retries,
        job_timeout_ms: args.job_timeout_ms,
        sweep_interval_secs: args.sweep_interval_secs,
        retention: RetentionPolicy::keep_last(args.keep_snapshots),
        ..EngineConfig::default()
    };
    let config = ServerConfig {
        listen_addr,
        games_path: args.games,
        engine,
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        games = %config.games_path.display(),
        workers = config.engine.queue_concurrency,
        max_retries = config.engine.max_retries,
        job_timeout_ms = config.engine.job_timeout_ms,
        sweep_interval_secs = ?config.engine.sweep_interval_secs,
        "Starting standings engine"
    );

    let games = Arc::new(JsonGameSource::new(config.games_path.clone()));
    let storage = Arc::new(MemoryStorage::with_history_limit(
        config.engine.history_limit,
    ));
    let controller = Arc::new(AutomationController::new(config.engine, games, storage)?);

    controller.start().await?;
    if args.paused {
        controller.pause()?;
    }

    let shutdown = install_shutdown_handler();
    let state = DashboardState {
        controller: controller.clone(),
    };
    let served = run_dashboard(config.listen_addr, state, shutdown.clone()).await;

    // Drain even if the API failed to start.
    controller.shutdown().await;
    served?;
    Ok(())
}

// =============================================================================
// Compute
// =============================================================================

async fn run_compute(args: ComputeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let source = JsonGameSource::new(args.games);
    let file = source.load().await?;
    let key = TableKey::new(args.league, args.season);
    let games = file.games_for(&key);
    let roster = file.roster_for(&key);
    let rules = TableRules {
        tie_break: args.tie_break.into(),
        ..TableRules::default()
    };

    let entries = match standings::compute(&games, roster.as_deref(), &rules) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("Error: {}: {}", key, e);
            std::process::exit(1);
        }
    };

    match args.output {
        OutputFormat::Json => {
            let output = TableOutput {
                league: &key.league,
                season: &key.season,
                entries: &entries,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("{}", key);
            println!(
                "{:>4}  {:<24} {:>3} {:>3} {:>3} {:>3} {:>7} {:>5} {:>4}",
                "#", "TEAM", "P", "W", "D", "L", "GOALS", "DIFF", "PTS"
            );
            println!("{}", "-".repeat(66));
            for e in &entries {
                println!(
                    "{:>4}  {:<24} {:>3} {:>3} {:>3} {:>3} {:>7} {:>+5} {:>4}",
                    e.rank,
                    e.team,
                    e.played,
                    e.won,
                    e.drawn,
                    e.lost,
                    format!("{}:{}", e.goals_for, e.goals_against),
                    e.goal_difference,
                    e.points
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve(serve_args) => run_serve(serve_args).await?,
        Commands::Compute(compute_args) => run_compute(compute_args).await?,
    }

    Ok(())
}
