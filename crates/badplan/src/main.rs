//! badplan - runs query executions through the pg_badplan executor hook.
//!
//! Executions come either from a JSON-lines replay file or from a live
//! `EXPLAIN (ANALYZE, FORMAT JSON)` against PostgreSQL. Flagged queries are
//! logged or dumped exactly as the hook would do inside the server.

mod explain;
mod replay;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use badplan_core::clock::SystemClock;
use badplan_core::hooks::HookChain;
use badplan_core::module::{self, LoadPhase};
use badplan_core::settings::SettingsStore;
use badplan_core::sink::VerdictSink;

/// Flags queries whose planner row estimates were badly off.
#[derive(Parser)]
#[command(name = "badplan", about = "Detect bad query plans from row estimates", version)]
struct Args {
    /// Set a parameter, e.g. `-c ratio=0.1` or `-c pg_badplan.log_directory=/tmp/plans`.
    /// May be repeated.
    #[arg(short = 'c', long = "set", value_name = "NAME=VALUE", value_parser = parse_assignment)]
    set: Vec<(String, String)>,

    /// Worker id used in dump file names. Defaults to the process id.
    #[arg(long)]
    backend_id: Option<u32>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay execution records from a JSON-lines file ("-" reads stdin).
    Replay {
        /// One record per line: {"query", "plan_rows", "actual_rows", "loops"}.
        file: PathBuf,
    },
    /// Run EXPLAIN (ANALYZE, FORMAT JSON) on a statement and judge it.
    ///
    /// ANALYZE executes the statement. Connection uses PGHOST, PGPORT,
    /// PGUSER (or USER), PGPASSWORD and PGDATABASE.
    Explain {
        /// Statement to analyze.
        sql: String,
    },
    /// List all parameters with their current and default values.
    Show {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Errors ending a CLI run.
#[derive(Debug, thiserror::Error)]
pub(crate) enum RunError {
    #[error(transparent)]
    Init(#[from] badplan_core::InitError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PostgreSQL: {0}")]
    Postgres(String),

    #[error("unexpected EXPLAIN output: {0}")]
    Explain(String),
}

/// Parses `NAME=VALUE`.
fn parse_assignment(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing parameter name in '{}'", s));
    }
    Ok((name.to_string(), value.to_string()))
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
/// Logs go to stderr so `show` output stays clean.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["badplan", "badplan_core"] {
        match format!("{}={}", target, level).parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("invalid log directive for {}: {}", target, e),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn show(settings: &SettingsStore, json: bool) -> ExitCode {
    let params = settings.parameters();
    if json {
        match serde_json::to_string_pretty(&params) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                error!("failed to serialize parameters: {}", e);
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    let width = params.iter().map(|p| p.name.len()).max().unwrap_or(0);
    for p in &params {
        println!(
            "{:width$}  {:<12} (default: {}) {}",
            p.name,
            p.value,
            if p.default.is_empty() { "''" } else { p.default.as_str() },
            p.description,
            width = width
        );
    }
    ExitCode::SUCCESS
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let settings = Arc::new(SettingsStore::new());
    for (name, value) in &args.set {
        if let Err(e) = settings.set(name, value) {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    }

    let backend_id = args.backend_id.unwrap_or_else(std::process::id);
    let result = match &args.command {
        Command::Show { json } => return show(&settings, *json),
        Command::Replay { file } => with_module(settings, backend_id, |chain| {
            replay::run(chain, file, backend_id)
        }),
        Command::Explain { sql } => with_module(settings, backend_id, |chain| {
            explain::run(chain, sql, backend_id)
        }),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

/// Installs pg_badplan on a fresh executor chain for the duration of `job`.
fn with_module(
    settings: Arc<SettingsStore>,
    backend_id: u32,
    job: impl FnOnce(&HookChain) -> Result<(), RunError>,
) -> Result<(), RunError> {
    let mut chain = HookChain::new();
    let sink = Arc::new(VerdictSink::new(Arc::new(SystemClock::new())));
    let installed = module::install(&mut chain, LoadPhase::SharedPreload, settings, sink)?;
    info!(
        "badplan {} starting (backend {})",
        env!("CARGO_PKG_VERSION"),
        backend_id
    );

    let result = job(&chain);

    if let Err(e) = installed.uninstall(&mut chain) {
        warn!("failed to remove executor hook: {}", e);
    }
    result
}
