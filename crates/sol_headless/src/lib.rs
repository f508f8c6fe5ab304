//! Headless lockstep runner for CI verification and desync hunting.
//!
//! Runs complete multi-peer matches in one process over the loopback
//! transport, with no rendering and no real network:
//!
//! - **Determinism checks**: every peer must finish with the same state hash
//! - **Desync drills**: corrupt one peer on purpose and watch detection fire
//! - **Recording verification**: replay a saved match and compare hashes
//!
//! # Output
//!
//! - **stdout**: one JSON summary per command
//! - **stderr**: logs (human-readable)
//!
//! # Example
//!
//! ```bash
//! # Four peers, ten thousand ticks
//! cargo run -p sol_headless -- run --players 4 --ticks 10000 --seed 12345
//!
//! # Record a match, then verify the recording
//! cargo run -p sol_headless -- run --record match.json
//! cargo run -p sol_headless -- verify --recording match.json
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use thiserror::Error;

use sol_sync::error::{ConfigError, SyncError};
use sol_test_utils::lockstep::RigError;

pub mod runner;
pub mod verify;

pub use runner::{parse_desync_at, run_match, PeerSummary, RunOptions, RunSummary};
pub use verify::{verify_file, verify_recording, VerifyReport};

/// Errors surfaced by the headless runner.
#[derive(Debug, Error)]
pub enum HeadlessError {
    /// A command-line value was malformed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The sync configuration file could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The match could not be set up.
    #[error(transparent)]
    Rig(#[from] RigError),

    /// A recording could not be read or written.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The summary could not be serialized.
    #[error("Failed to serialize output: {0}")]
    Output(#[from] serde_json::Error),
}
