//! Post-hoc state verification.
//!
//! Every `K` ticks each peer hashes its simulation state and shares the hash
//! over the `__state_hash__` side channel. Once a tick has one hash from
//! every roster player it is judged exactly once: equal hashes resolve
//! silently, anything else yields a single [`DesyncReport`]. Detection only,
//! the verifier never attempts recovery.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::command::{Command, GameCommand, PlayerId};
use crate::transport::Transport;

/// Diagnostic payload of a detected desync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesyncReport {
    /// Tick whose hashes disagree.
    pub tick: u64,
    /// Every roster player's hash for the tick.
    pub hashes: BTreeMap<PlayerId, u64>,
    /// Players whose hash differs from the local player's.
    pub diverged_players: Vec<PlayerId>,
}

/// Verification counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierStats {
    /// Ticks judged so far.
    pub ticks_checked: u64,
    /// Ticks judged inconsistent.
    pub desyncs_detected: u64,
    /// Ticks still waiting for hashes.
    pub pending_ticks: usize,
}

/// Collects per-tick hashes from every player and judges them.
#[derive(Debug, Clone)]
pub struct StateVerifier {
    local: PlayerId,
    roster: BTreeSet<PlayerId>,
    pending: BTreeMap<u64, BTreeMap<PlayerId, u64>>,
    judged: BTreeSet<u64>,
    history: usize,
    /// Hashes for ticks below this are stale and ignored.
    low_watermark: u64,
    stats: VerifierStats,
}

impl StateVerifier {
    /// Create a verifier tracking `roster`. `history` bounds both the number
    /// of judged ticks remembered and the number of incomplete ticks kept.
    pub fn new<I>(local: PlayerId, roster: I, history: usize) -> Self
    where
        I: IntoIterator<Item = PlayerId>,
    {
        let mut roster: BTreeSet<PlayerId> = roster.into_iter().collect();
        roster.insert(local.clone());
        Self {
            local,
            roster,
            pending: BTreeMap::new(),
            judged: BTreeSet::new(),
            history: history.max(1),
            low_watermark: 0,
            stats: VerifierStats::default(),
        }
    }

    /// Record the local hash for `tick` and broadcast it to peers.
    pub fn submit_hash(
        &mut self,
        tick: u64,
        hash: u64,
        transport: &mut dyn Transport,
    ) -> Option<DesyncReport> {
        let message = GameCommand::new(tick, self.local.clone(), Command::StateHash { hash });
        if let Err(err) = transport.send_command(&message) {
            warn!(tick, error = %err, "Failed to broadcast state hash");
        }
        let local = self.local.clone();
        self.record(tick, local, hash)
    }

    /// Record a hash received from a peer.
    pub fn receive_hash(&mut self, tick: u64, player: PlayerId, hash: u64) -> Option<DesyncReport> {
        self.record(tick, player, hash)
    }

    /// Drop every pending and judged tick.
    ///
    /// The low watermark and the counters are kept, so ticks judged before
    /// the clear stay closed and [`stats`](Self::stats) still totals them.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.judged.clear();
        self.stats.pending_ticks = 0;
    }

    /// Verification counters.
    #[must_use]
    pub fn stats(&self) -> VerifierStats {
        VerifierStats {
            pending_ticks: self.pending.len(),
            ..self.stats.clone()
        }
    }

    fn record(&mut self, tick: u64, player: PlayerId, hash: u64) -> Option<DesyncReport> {
        if tick < self.low_watermark || self.judged.contains(&tick) {
            debug!(tick, player = %player, "Ignoring hash for an already judged tick");
            return None;
        }
        if !self.roster.contains(&player) {
            warn!(tick, player = %player, "Ignoring hash from a player outside the roster");
            return None;
        }

        let entry = self.pending.entry(tick).or_default();
        if let Some(&previous) = entry.get(&player) {
            if previous != hash {
                warn!(tick, player = %player, previous, hash, "Conflicting duplicate hash ignored");
            }
            return None;
        }
        entry.insert(player, hash);

        let complete = entry.len() == self.roster.len();
        let report = if complete { self.judge(tick) } else { None };
        self.prune();
        report
    }

    fn judge(&mut self, tick: u64) -> Option<DesyncReport> {
        let hashes = self.pending.remove(&tick)?;
        self.judged.insert(tick);
        self.stats.ticks_checked += 1;

        let reference = hashes
            .get(&self.local)
            .or_else(|| hashes.values().next())
            .copied()?;
        let diverged_players: Vec<PlayerId> = hashes
            .iter()
            .filter(|(_, h)| **h != reference)
            .map(|(player, _)| player.clone())
            .collect();

        if diverged_players.is_empty() {
            debug!(tick, hash = reference, "State hashes agree");
            return None;
        }

        self.stats.desyncs_detected += 1;
        warn!(tick, ?hashes, "Desync detected");
        Some(DesyncReport {
            tick,
            hashes,
            diverged_players,
        })
    }

    fn prune(&mut self) {
        while self.judged.len() > self.history {
            if let Some(oldest) = self.judged.pop_first() {
                self.low_watermark = self.low_watermark.max(oldest + 1);
            }
        }
        while self.pending.len() > self.history {
            // Sets the local player never hashed are speculative; drop the
            // farthest of those before any tick this peer has reached.
            let speculative = self
                .pending
                .iter()
                .rev()
                .find(|(_, hashes)| !hashes.contains_key(&self.local))
                .map(|(&tick, _)| tick);
            match speculative {
                Some(tick) => {
                    self.pending.remove(&tick);
                    debug!(tick, "Evicting speculative hash set");
                }
                None => {
                    if let Some((tick, hashes)) = self.pending.pop_first() {
                        debug!(tick, received = hashes.len(), "Abandoning incomplete hash set");
                        self.low_watermark = self.low_watermark.max(tick + 1);
                    }
                }
            }
        }
        let watermark = self.low_watermark;
        self.pending.retain(|&tick, _| tick >= watermark);
    }
}
