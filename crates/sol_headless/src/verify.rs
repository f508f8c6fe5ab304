//! Recording verification.
//!
//! Replays a [`MatchRecording`] on a fresh arena and checks every recorded
//! state hash. A recording that fails here was produced by a simulation
//! that is not a pure function of its seed and commands.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use sol_sync::replay::MatchRecording;
use sol_sync::store::GameSettings;
use sol_test_utils::determinism::replay_hashes;

use crate::HeadlessError;

/// Result of replaying a recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Recorded match.
    pub match_id: String,
    /// Seed replayed.
    pub seed: u64,
    /// Ticks replayed.
    pub ticks: u64,
    /// Commands replayed.
    pub commands: usize,
    /// Checkpoints compared.
    pub checkpoints_checked: usize,
    /// Ticks whose replayed hash differs from the recorded one.
    pub mismatched_checkpoints: Vec<u64>,
    /// Final hash stored in the recording.
    pub expected_final_hash: u64,
    /// Final hash produced by the replay.
    pub actual_final_hash: u64,
}

impl VerifyReport {
    /// True when every checkpoint and the final hash match.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.mismatched_checkpoints.is_empty() && self.expected_final_hash == self.actual_final_hash
    }
}

/// Replay `recording` and compare hashes.
#[must_use]
pub fn verify_recording(recording: &MatchRecording) -> VerifyReport {
    let hashes = replay_hashes(
        recording.seed,
        &recording.roster,
        &GameSettings::default(),
        recording.playback(),
    );

    let mut checked = 0;
    let mut mismatched = Vec::new();
    for (&tick, &expected) in &recording.checkpoints {
        match hashes.get(tick as usize) {
            Some(&actual) => {
                checked += 1;
                if actual != expected {
                    warn!(tick, expected, actual, "Checkpoint mismatch");
                    mismatched.push(tick);
                }
            }
            None => {
                warn!(tick, "Checkpoint beyond the end of the recording");
                mismatched.push(tick);
            }
        }
    }

    let report = VerifyReport {
        match_id: recording.match_id.to_string(),
        seed: recording.seed,
        ticks: recording.final_tick,
        commands: recording.command_count(),
        checkpoints_checked: checked,
        mismatched_checkpoints: mismatched,
        expected_final_hash: recording.final_hash,
        actual_final_hash: hashes.last().copied().unwrap_or_default(),
    };
    info!(
        match_id = %report.match_id,
        ticks = report.ticks,
        passed = report.passed(),
        "Recording verified"
    );
    report
}

/// Load a recording from disk and verify it.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn verify_file(path: &Path) -> Result<VerifyReport, HeadlessError> {
    let recording = MatchRecording::load(path)?;
    Ok(verify_recording(&recording))
}
