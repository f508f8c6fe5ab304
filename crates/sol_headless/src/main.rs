//! Headless SoL lockstep runner.
//!
//! Plays in-process multiplayer matches without graphics and reports the
//! result as JSON. Designed for CI determinism checks and desync hunting.
//!
//! # Usage
//!
//! ```bash
//! # Two peers, default length
//! cargo run -p sol_headless -- run
//!
//! # Inject a desync on peer 1 after tick 250
//! cargo run -p sol_headless -- run --players 3 --desync-at 1:250
//!
//! # Verify a recording
//! cargo run -p sol_headless -- verify --recording match.json
//! ```
//!
//! Exit status is non-zero when peers diverge or a recording fails to verify.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sol_headless::{parse_desync_at, run_match, verify_file, HeadlessError, RunOptions};

#[derive(Parser)]
#[command(name = "sol_headless")]
#[command(about = "Headless SoL lockstep runner for CI and desync hunting")]
#[command(version)]
struct Cli {
    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play one match between in-process peers
    Run {
        /// Number of peers
        #[arg(short, long, default_value = "2")]
        players: usize,

        /// Ticks to simulate
        #[arg(short, long, default_value = "1200")]
        ticks: u64,

        /// Match seed (random when omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Corrupt one peer after a tick, as PEER:TICK
        #[arg(long)]
        desync_at: Option<String>,

        /// Write the host's recording to this file
        #[arg(long)]
        record: Option<PathBuf>,

        /// RON file with sync configuration overrides
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Replay a recording and check its state hashes
    Verify {
        /// Recording file path
        #[arg(short, long)]
        recording: PathBuf,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging to stderr (stdout is for results)
    let log_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(tracing_subscriber::filter::LevelFilter::from_level(
            log_level,
        ))
        .init();

    let result = match cli.command {
        Commands::Run {
            players,
            ticks,
            seed,
            desync_at,
            record,
            config,
        } => cmd_run(players, ticks, seed, desync_at, record, config).await,
        Commands::Verify { recording } => cmd_verify(recording),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(2)
        }
    }
}

/// Run a match and print its summary
async fn cmd_run(
    players: usize,
    ticks: u64,
    seed: Option<u64>,
    desync_at: Option<String>,
    record: Option<PathBuf>,
    config: Option<PathBuf>,
) -> Result<bool, HeadlessError> {
    let options = RunOptions {
        players,
        ticks,
        seed,
        desync_at: desync_at.as_deref().map(parse_desync_at).transpose()?,
        record,
        config,
    };
    let summary = run_match(&options).await?;
    print_json(&summary)?;

    if summary.passed() {
        eprintln!("PASS: {} peers in sync after {} ticks", summary.players, summary.ticks);
    } else {
        eprintln!(
            "FAIL: desync detected (first at tick {:?})",
            summary.first_desync_tick
        );
    }
    Ok(summary.passed())
}

/// Verify a recording and print the report
fn cmd_verify(recording: PathBuf) -> Result<bool, HeadlessError> {
    tracing::info!("Verifying recording: {}", recording.display());
    let report = verify_file(&recording)?;
    print_json(&report)?;

    if report.passed() {
        eprintln!(
            "PASS: {} ticks, {} checkpoints match",
            report.ticks, report.checkpoints_checked
        );
    } else {
        eprintln!(
            "FAIL: replay diverged (checkpoints {:?}, final {} != {})",
            report.mismatched_checkpoints, report.actual_final_hash, report.expected_final_hash
        );
    }
    Ok(report.passed())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), HeadlessError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
