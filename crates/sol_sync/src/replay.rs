//! Match recordings.
//!
//! A recording stores the match seed, the roster and every resolved tick.
//! Since the simulation is a pure function of seed and tick commands, that
//! is enough to recreate the match on any machine and check it against the
//! recorded state hashes.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::command::{GameCommand, MatchId, PlayerId, TickCommands};
use crate::error::{Result, SyncError};

/// Recording format version.
pub const RECORDING_VERSION: u32 = 1;

/// Everything needed to recreate a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRecording {
    /// Format version.
    pub version: u32,
    /// Recorded match.
    pub match_id: MatchId,
    /// Match seed.
    pub seed: u64,
    /// Every player, sorted.
    pub roster: Vec<PlayerId>,
    /// Resolved ticks in order. Idle ticks are omitted.
    pub ticks: Vec<TickCommands>,
    /// State hashes captured while recording, by tick.
    #[serde(default)]
    pub checkpoints: BTreeMap<u64, u64>,
    /// Number of ticks played.
    pub final_tick: u64,
    /// State hash after the last tick.
    pub final_hash: u64,
}

impl MatchRecording {
    /// Start an empty recording.
    pub fn new<I>(match_id: MatchId, seed: u64, roster: I) -> Self
    where
        I: IntoIterator<Item = PlayerId>,
    {
        let mut roster: Vec<PlayerId> = roster.into_iter().collect();
        roster.sort();
        Self {
            version: RECORDING_VERSION,
            match_id,
            seed,
            roster,
            ticks: Vec::new(),
            checkpoints: BTreeMap::new(),
            final_tick: 0,
            final_hash: 0,
        }
    }

    /// Append a resolved tick. Idle ticks are not stored.
    pub fn record_tick(&mut self, resolved: &TickCommands) {
        if !resolved.is_idle() {
            self.ticks.push(resolved.clone());
        }
    }

    /// Remember the state hash at `tick`.
    pub fn record_hash(&mut self, tick: u64, hash: u64) {
        self.checkpoints.insert(tick, hash);
    }

    /// Close the recording with end-of-match state.
    pub fn finalize(&mut self, final_tick: u64, final_hash: u64) {
        self.final_tick = final_tick;
        self.final_hash = final_hash;
    }

    /// Commands resolved for `tick`, empty for idle ticks.
    #[must_use]
    pub fn commands_at_tick(&self, tick: u64) -> &[GameCommand] {
        match self.ticks.binary_search_by_key(&tick, |t| t.tick) {
            Ok(index) => &self.ticks[index].commands,
            Err(_) => &[],
        }
    }

    /// Total number of recorded commands.
    #[must_use]
    pub fn command_count(&self) -> usize {
        self.ticks.iter().map(|t| t.commands.len()).sum()
    }

    /// Length of the match in ticks.
    #[must_use]
    pub const fn duration(&self) -> u64 {
        self.final_tick
    }

    /// Serialize to pretty JSON.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SyncError::Recording(format!("Failed to serialize recording: {e}")))
    }

    /// Parse from JSON, checking the format version.
    ///
    /// # Errors
    /// Returns an error on malformed input or a version mismatch.
    pub fn from_json(text: &str) -> Result<Self> {
        let recording: Self = serde_json::from_str(text)
            .map_err(|e| SyncError::Recording(format!("Failed to parse recording: {e}")))?;
        if recording.version != RECORDING_VERSION {
            return Err(SyncError::Recording(format!(
                "Recording version mismatch: expected {RECORDING_VERSION}, got {}",
                recording.version
            )));
        }
        Ok(recording)
    }

    /// Save to a file.
    ///
    /// # Errors
    /// Returns an error if serialization or writing fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = self.to_json()?;
        std::fs::write(path.as_ref(), text)
            .map_err(|e| SyncError::Recording(format!("Failed to write recording file: {e}")))
    }

    /// Load from a file.
    ///
    /// # Errors
    /// Returns an error if reading, parsing or the version check fails.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| SyncError::Recording(format!("Failed to read recording file: {e}")))?;
        Self::from_json(&text)
    }

    /// Iterate every tick from 0 to `final_tick`, idle ticks included.
    #[must_use]
    pub fn playback(&self) -> Playback<'_> {
        Playback {
            recording: self,
            next_tick: 0,
            index: 0,
        }
    }
}

/// Tick-by-tick cursor over a [`MatchRecording`].
#[derive(Debug, Clone)]
pub struct Playback<'a> {
    recording: &'a MatchRecording,
    next_tick: u64,
    index: usize,
}

impl Playback<'_> {
    /// Next tick the cursor will yield.
    #[must_use]
    pub const fn current_tick(&self) -> u64 {
        self.next_tick
    }

    /// True once every tick has been yielded.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.next_tick >= self.recording.final_tick
    }
}

impl Iterator for Playback<'_> {
    type Item = TickCommands;

    fn next(&mut self) -> Option<TickCommands> {
        if self.is_finished() {
            return None;
        }
        let tick = self.next_tick;
        self.next_tick += 1;

        match self.recording.ticks.get(self.index) {
            Some(recorded) if recorded.tick == tick => {
                self.index += 1;
                Some(recorded.clone())
            }
            _ => Some(TickCommands {
                tick,
                commands: Vec::new(),
            }),
        }
    }
}
