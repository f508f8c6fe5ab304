//! Headless match runner.
//!
//! Plays one in-process lockstep match and condenses the rig outcome into a
//! JSON-friendly [`RunSummary`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use sol_sync::config::SyncConfig;
use sol_sync::events::EndReason;
use sol_sync::rng::generate_seed;
use sol_test_utils::lockstep::{run_lockstep_match, DesyncInjection, RigConfig, RigOutcome};

use crate::HeadlessError;

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Number of peers.
    pub players: usize,
    /// Ticks to simulate.
    pub ticks: u64,
    /// Match seed; generated when absent.
    pub seed: Option<u64>,
    /// Divergence to inject, if any.
    pub desync_at: Option<DesyncInjection>,
    /// Where to write the host's recording.
    pub record: Option<PathBuf>,
    /// RON file with sync configuration overrides.
    pub config: Option<PathBuf>,
}

/// Per-peer line of a [`RunSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    /// Player id.
    pub player: String,
    /// Ticks simulated.
    pub final_tick: u64,
    /// Final state hash.
    pub final_hash: u64,
    /// Desyncs this peer detected.
    pub desyncs: usize,
    /// Errors this peer reported.
    pub errors: usize,
    /// Why the peer's match ended.
    pub ended: Option<EndReason>,
}

/// Result of a headless run, printed as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Match played.
    pub match_id: String,
    /// Seed used.
    pub seed: u64,
    /// Number of peers.
    pub players: usize,
    /// Ticks requested.
    pub ticks: u64,
    /// Every peer finished with the same state.
    pub in_sync: bool,
    /// Any peer detected a desync.
    pub desync_detected: bool,
    /// Earliest diverged tick, if any.
    pub first_desync_tick: Option<u64>,
    /// Per-peer results.
    pub peers: Vec<PeerSummary>,
    /// Recording file written, if any.
    pub recording: Option<PathBuf>,
}

impl RunSummary {
    /// Condense a rig outcome.
    #[must_use]
    pub fn from_outcome(outcome: &RigOutcome, recording: Option<PathBuf>) -> Self {
        Self {
            match_id: outcome.match_id.to_string(),
            seed: outcome.seed,
            players: outcome.peers.len(),
            ticks: outcome.ticks,
            in_sync: outcome.in_sync(),
            desync_detected: outcome.desync_detected(),
            first_desync_tick: outcome.first_desync_tick(),
            peers: outcome
                .peers
                .iter()
                .map(|peer| PeerSummary {
                    player: peer.player.to_string(),
                    final_tick: peer.final_tick,
                    final_hash: peer.final_hash,
                    desyncs: peer.desyncs.len(),
                    errors: peer.errors.len(),
                    ended: peer.ended,
                })
                .collect(),
            recording,
        }
    }

    /// True when the run is clean: in sync and no desync reported.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.in_sync && !self.desync_detected
    }
}

/// Parse a `PEER:TICK` desync injection.
pub fn parse_desync_at(text: &str) -> Result<DesyncInjection, HeadlessError> {
    let invalid = || HeadlessError::InvalidArgument(format!("expected PEER:TICK, got '{text}'"));
    let (peer, tick) = text.split_once(':').ok_or_else(invalid)?;
    Ok(DesyncInjection {
        peer: peer.trim().parse().map_err(|_| invalid())?,
        tick: tick.trim().parse().map_err(|_| invalid())?,
    })
}

/// Run one match.
///
/// # Errors
///
/// Returns an error for an unreadable configuration, a failed match setup
/// or an unwritable recording.
pub async fn run_match(options: &RunOptions) -> Result<RunSummary, HeadlessError> {
    let sync = match &options.config {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };
    if let Some(inject) = options.desync_at {
        if inject.peer >= options.players {
            return Err(HeadlessError::InvalidArgument(format!(
                "desync peer {} out of range for {} players",
                inject.peer, options.players
            )));
        }
    }

    let seed = options.seed.unwrap_or_else(generate_seed);
    let config = RigConfig {
        players: options.players,
        ticks: options.ticks,
        seed,
        desync_at: options.desync_at,
        record: options.record.is_some(),
        sync,
        ..RigConfig::default()
    };
    info!(
        players = config.players,
        ticks = config.ticks,
        seed,
        "Running headless match"
    );

    let outcome = run_lockstep_match(&config).await?;

    let written = match (&options.record, &outcome.recording) {
        (Some(path), Some(recording)) => {
            recording.save(path)?;
            info!(path = %path.display(), commands = recording.command_count(), "Recording saved");
            Some(path.clone())
        }
        _ => None,
    };

    let summary = RunSummary::from_outcome(&outcome, written);
    if !summary.passed() {
        warn!(first_desync = ?summary.first_desync_tick, "Peers diverged");
    }
    Ok(summary)
}
