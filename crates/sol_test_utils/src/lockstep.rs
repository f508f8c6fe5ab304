//! Multi-peer lockstep rig.
//!
//! Runs a whole match in one process: every peer gets its own
//! [`NetworkManager`] and [`Arena`], wired together through a
//! [`LoopbackNetwork`] and a shared [`MemoryMatchStore`]. Peers are driven
//! round-robin, the way independent frame loops would interleave, and each
//! one feeds scripted input from its own RNG.
//!
//! The rig is what the integration tests and the headless runner use to
//! prove that identical input produces identical state on every peer, and
//! that an injected divergence is caught by the hash exchange.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use sol_sync::command::{Command, MatchId, PlayerId, StructureKind, UnitKind};
use sol_sync::config::SyncConfig;
use sol_sync::events::{EndReason, ErrorCause, NetworkEvent};
use sol_sync::manager::{MatchPhase, NetworkManager, NetworkStats};
use sol_sync::math::Vec2Fixed;
use sol_sync::replay::MatchRecording;
use sol_sync::rng::SeededRng;
use sol_sync::store::{CreateMatchOptions, GameSettings, MemoryMatchStore};
use sol_sync::transport::LoopbackNetwork;
use sol_sync::verifier::DesyncReport;

use crate::arena::Arena;
use crate::fixtures;

/// Manager type every rig peer uses.
pub type RigManager = NetworkManager<MemoryMatchStore, LoopbackNetwork>;

/// Shared log of every event a peer emitted.
pub type EventLog = Rc<RefCell<Vec<NetworkEvent>>>;

/// Rounds without any peer resolving a tick before the rig gives up.
const MAX_IDLE_ROUNDS: u32 = 8;

/// Corrupt one peer's state right after it applies a given tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesyncInjection {
    /// Index of the peer to corrupt, in roster order.
    pub peer: usize,
    /// Tick after which the corruption happens.
    pub tick: u64,
}

/// Rig parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    /// Number of peers.
    pub players: usize,
    /// Ticks every peer simulates.
    pub ticks: u64,
    /// Match seed.
    pub seed: u64,
    /// Optional divergence to inject.
    pub desync_at: Option<DesyncInjection>,
    /// Keep a recording of the match, taken from the host.
    pub record: bool,
    /// Sync core configuration shared by every peer.
    pub sync: SyncConfig,
    /// Gameplay settings for the match.
    pub settings: GameSettings,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            players: 2,
            ticks: 600,
            seed: 12345,
            desync_at: None,
            record: false,
            sync: SyncConfig::default(),
            settings: GameSettings::default(),
        }
    }
}

/// Failures that stop the rig before any tick is simulated.
#[derive(Debug, Error)]
pub enum RigError {
    /// A match needs at least one player.
    #[error("Rig needs at least one player")]
    NoPlayers,

    /// A lobby step failed on one peer.
    #[error("{player} failed to {step}: {message}")]
    Setup {
        /// Peer that failed.
        player: PlayerId,
        /// What it was doing.
        step: &'static str,
        /// Last error the peer reported.
        message: String,
    },

    /// A peer never reached the active phase.
    #[error("{player} never became active (phase {phase:?})")]
    NotActive {
        /// Peer that is stuck.
        player: PlayerId,
        /// Phase it ended up in.
        phase: MatchPhase,
    },
}

/// What one peer saw during the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerOutcome {
    /// The peer.
    pub player: PlayerId,
    /// Ticks the peer simulated.
    pub final_tick: u64,
    /// Hash of the peer's arena at the end.
    pub final_hash: u64,
    /// Every desync the peer detected.
    pub desyncs: Vec<DesyncReport>,
    /// Every error the peer reported.
    pub errors: Vec<(ErrorCause, String)>,
    /// Why the peer's match ended.
    pub ended: Option<EndReason>,
    /// Manager diagnostics taken just before teardown.
    pub stats: NetworkStats,
}

/// Result of a rig run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RigOutcome {
    /// The match played.
    pub match_id: MatchId,
    /// Its seed.
    pub seed: u64,
    /// Ticks every peer was asked to simulate.
    pub ticks: u64,
    /// One entry per peer, in roster order.
    pub peers: Vec<PeerOutcome>,
    /// Host recording, when requested.
    #[serde(skip)]
    pub recording: Option<MatchRecording>,
}

impl RigOutcome {
    /// True when every peer reached the last tick with the same final hash.
    #[must_use]
    pub fn in_sync(&self) -> bool {
        let Some(first) = self.peers.first() else {
            return false;
        };
        self.peers
            .iter()
            .all(|p| p.final_tick == self.ticks && p.final_hash == first.final_hash)
    }

    /// True when any peer detected a desync.
    #[must_use]
    pub fn desync_detected(&self) -> bool {
        self.peers.iter().any(|p| !p.desyncs.is_empty())
    }

    /// Earliest tick any peer flagged as diverged.
    #[must_use]
    pub fn first_desync_tick(&self) -> Option<u64> {
        self.peers
            .iter()
            .flat_map(|p| p.desyncs.iter().map(|d| d.tick))
            .min()
    }
}

/// One simulated client.
struct Peer {
    manager: RigManager,
    log: EventLog,
    arena: Option<Arena>,
    input: SeededRng,
    last_input: Option<u64>,
}

impl Peer {
    fn new(
        index: usize,
        player: PlayerId,
        store: &MemoryMatchStore,
        network: &LoopbackNetwork,
        config: &RigConfig,
    ) -> Self {
        let mut manager = NetworkManager::new(
            player,
            store.clone(),
            network.clone(),
            config.sync.clone(),
        );
        let log = record_events(&mut manager);
        Self {
            manager,
            log,
            arena: None,
            input: SeededRng::new(input_seed(config.seed, index)),
            last_input: None,
        }
    }

    fn player(&self) -> PlayerId {
        self.manager.local_player_id().clone()
    }

    fn finished(&self, ticks: u64) -> bool {
        self.manager.phase() != MatchPhase::Active || self.manager.current_tick() >= ticks
    }

    fn last_error(&self) -> String {
        self.log
            .borrow()
            .iter()
            .rev()
            .find_map(|event| match event {
                NetworkEvent::Error { message, .. } => Some(message.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "no error reported".to_string())
    }

    fn setup_error(&self, step: &'static str) -> RigError {
        RigError::Setup {
            player: self.player(),
            step,
            message: self.last_error(),
        }
    }

    /// One frame of this peer. Returns `true` if a tick was resolved.
    async fn frame(
        &mut self,
        index: usize,
        config: &RigConfig,
        mut recording: Option<&mut MatchRecording>,
    ) -> bool {
        self.manager.poll().await;
        if self.manager.phase() != MatchPhase::Active {
            return false;
        }
        let tick = self.manager.current_tick();
        let Some(arena) = self.arena.as_mut() else {
            return false;
        };

        if self.last_input != Some(tick) {
            self.last_input = Some(tick);
            let player = self.manager.local_player_id().clone();
            let extent = config.settings.map_half_extent;
            for command in scripted_input(arena, &player, &mut self.input, extent) {
                self.manager.send_command(command);
            }
        }

        let Some(resolved) = self.manager.get_next_tick_commands() else {
            return false;
        };
        arena.step(&resolved);
        if config
            .desync_at
            .is_some_and(|inject| inject.peer == index && inject.tick == tick)
        {
            warn!(player = %self.manager.local_player_id(), tick, "Injecting desync");
            arena.corrupt();
        }
        if let Some(recording) = recording.as_mut() {
            recording.record_tick(&resolved);
        }

        if tick % config.sync.hash_interval_ticks.max(1) == 0 {
            let hash = arena.state_hash();
            self.manager.submit_state_hash(hash);
            if let Some(recording) = recording.as_mut() {
                recording.record_hash(tick, hash);
            }
        }

        self.manager.advance_tick();
        true
    }

    fn outcome(&self) -> PeerOutcome {
        let log = self.log.borrow();
        PeerOutcome {
            player: self.player(),
            final_tick: self.manager.current_tick(),
            final_hash: self.arena.as_ref().map_or(0, Arena::state_hash),
            desyncs: log
                .iter()
                .filter_map(|event| match event {
                    NetworkEvent::DesyncDetected { report } => Some(report.clone()),
                    _ => None,
                })
                .collect(),
            errors: log
                .iter()
                .filter_map(|event| match event {
                    NetworkEvent::Error { cause, message } => {
                        Some((cause.clone(), message.clone()))
                    }
                    _ => None,
                })
                .collect(),
            ended: log.iter().rev().find_map(|event| match event {
                NetworkEvent::MatchEnded { reason, .. } => Some(*reason),
                _ => None,
            }),
            stats: self.manager.stats(),
        }
    }
}

/// Subscribe a recorder for every event `manager` emits.
pub fn record_events(manager: &mut RigManager) -> EventLog {
    let log: EventLog = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    manager
        .events_mut()
        .subscribe_all(move |event| sink.borrow_mut().push(event.clone()));
    log
}

/// Input RNG seed for the peer at `index`, independent of the match RNG.
fn input_seed(seed: u64, index: usize) -> u64 {
    seed ^ (index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Random but valid orders for `player`, based on its view of the arena.
fn scripted_input(
    arena: &Arena,
    player: &PlayerId,
    rng: &mut SeededRng,
    extent: i32,
) -> Vec<Command> {
    let own = arena.units_of(player);
    let roll = rng.next_int(0, 99);

    match roll {
        0..=7 if !own.is_empty() => vec![Command::MoveUnits {
            unit_ids: pick(rng, &own, 3),
            target: random_position(rng, extent),
        }],
        8..=9 => vec![Command::ProduceUnit {
            unit: UnitKind::Drone,
            count: 1,
        }],
        10 => vec![Command::BuildStructure {
            structure: StructureKind::SolarMirror,
            position: random_position(rng, extent),
        }],
        11..=12 if !own.is_empty() => {
            let enemies: Vec<u32> = arena
                .units()
                .filter(|unit| &unit.owner != player)
                .map(|unit| unit.id)
                .collect();
            if enemies.is_empty() {
                return Vec::new();
            }
            let target = pick(rng, &enemies, 1);
            target
                .first()
                .map(|&target_id| Command::Attack {
                    unit_ids: pick(rng, &own, 2),
                    target_id,
                })
                .into_iter()
                .collect()
        }
        13 if !own.is_empty() => vec![Command::CastAbility {
            unit_id: own[0],
            ability: "blink".to_string(),
            target: Some(random_position(rng, extent)),
        }],
        _ => Vec::new(),
    }
}

fn random_position(rng: &mut SeededRng, extent: i32) -> Vec2Fixed {
    let x = rng.next_int(-i64::from(extent), i64::from(extent));
    let y = rng.next_int(-i64::from(extent), i64::from(extent));
    Vec2Fixed::from_ints(x as i32, y as i32)
}

/// Up to `max` distinct ids from a non-empty `units`, starting at a random one.
fn pick(rng: &mut SeededRng, units: &[u32], max: usize) -> Vec<u32> {
    let start = rng.next_int(0, units.len() as i64 - 1) as usize;
    units
        .iter()
        .cycle()
        .skip(start)
        .take(units.len().min(max))
        .copied()
        .collect()
}

/// Play a full match between `config.players` in-process peers.
///
/// # Errors
///
/// Returns an error if the lobby or connection phase fails. Failures after
/// the match starts are reported in the outcome instead.
pub async fn run_lockstep_match(config: &RigConfig) -> Result<RigOutcome, RigError> {
    if config.players == 0 {
        return Err(RigError::NoPlayers);
    }
    let store = MemoryMatchStore::new();
    let network = LoopbackNetwork::new();
    let mut peers: Vec<Peer> = fixtures::roster(config.players)
        .into_iter()
        .enumerate()
        .map(|(index, player)| Peer::new(index, player, &store, &network, config))
        .collect();

    // Lobby
    let options = CreateMatchOptions {
        max_players: config.players,
        seed: Some(config.seed),
        settings: config.settings.clone(),
        ..CreateMatchOptions::default()
    };
    let created = match peers[0].manager.create_match(options).await {
        Some(created) => created,
        None => return Err(peers[0].setup_error("create a match")),
    };
    for peer in peers.iter_mut().skip(1) {
        if !peer.manager.join_match(&created.id).await {
            return Err(peer.setup_error("join the match"));
        }
    }

    // Connection
    for peer in &mut peers {
        if !peer.manager.start_match().await {
            return Err(peer.setup_error("start the match"));
        }
    }
    for peer in &mut peers {
        peer.manager.poll().await;
        if peer.manager.phase() != MatchPhase::Active {
            return Err(RigError::NotActive {
                player: peer.player(),
                phase: peer.manager.phase(),
            });
        }
        let rng = peer
            .manager
            .create_rng()
            .unwrap_or_else(|| SeededRng::new(created.game_seed));
        peer.arena = Some(Arena::new(
            rng,
            peer.manager.roster().iter().cloned(),
            &created.game_settings,
        ));
    }
    info!(match_id = %created.id, players = config.players, ticks = config.ticks, "Rig match running");

    let mut recording = config.record.then(|| {
        MatchRecording::new(
            created.id.clone(),
            created.game_seed,
            peers[0].manager.roster().iter().cloned(),
        )
    });

    // Simulation
    let mut idle_rounds = 0;
    loop {
        let mut running = false;
        let mut progressed = false;
        for (index, peer) in peers.iter_mut().enumerate() {
            if peer.finished(config.ticks) {
                continue;
            }
            running = true;
            let record = if index == 0 { recording.as_mut() } else { None };
            progressed |= peer.frame(index, config, record).await;
        }
        if !running {
            break;
        }
        if progressed {
            idle_rounds = 0;
        } else {
            idle_rounds += 1;
            if idle_rounds >= MAX_IDLE_ROUNDS {
                warn!(rounds = idle_rounds, "No peer is making progress, stopping rig");
                break;
            }
        }
    }

    // Let the last state hashes reach every peer
    for _ in 0..2 {
        for peer in &mut peers {
            peer.manager.poll().await;
        }
    }

    if let Some(recording) = recording.as_mut() {
        let host = &peers[0];
        let final_hash = host.arena.as_ref().map_or(0, Arena::state_hash);
        recording.finalize(host.manager.current_tick(), final_hash);
    }

    let mut snapshots: Vec<NetworkStats> = Vec::with_capacity(peers.len());
    for peer in &mut peers {
        snapshots.push(peer.manager.stats());
        peer.manager.end_match(EndReason::UserEnded).await;
    }

    let outcomes: Vec<PeerOutcome> = peers
        .iter()
        .zip(snapshots)
        .map(|(peer, stats)| PeerOutcome {
            stats,
            ..peer.outcome()
        })
        .collect();
    for outcome in &outcomes {
        debug!(
            player = %outcome.player,
            tick = outcome.final_tick,
            hash = outcome.final_hash,
            desyncs = outcome.desyncs.len(),
            "Peer finished"
        );
    }

    Ok(RigOutcome {
        match_id: created.id,
        seed: created.game_seed,
        ticks: config.ticks,
        peers: outcomes,
        recording,
    })
}

/// Two-peer match with default settings.
///
/// # Errors
///
/// See [`run_lockstep_match`].
pub async fn run_lockstep_pair(seed: u64, ticks: u64) -> Result<RigOutcome, RigError> {
    run_lockstep_match(&RigConfig {
        seed,
        ticks,
        ..RigConfig::default()
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_stays_in_sync() {
        let outcome = run_lockstep_pair(12345, 300).await.unwrap();
        assert!(outcome.in_sync(), "{:?}", outcome.peers);
        assert!(!outcome.desync_detected());
        for peer in &outcome.peers {
            assert_eq!(peer.final_tick, 300);
            assert_eq!(peer.ended, Some(EndReason::UserEnded));
            assert!(peer.errors.is_empty(), "{:?}", peer.errors);
        }
    }

    #[tokio::test]
    async fn test_zero_players_rejected() {
        let config = RigConfig {
            players: 0,
            ..RigConfig::default()
        };
        assert!(matches!(
            run_lockstep_match(&config).await,
            Err(RigError::NoPlayers)
        ));
    }

    #[tokio::test]
    async fn test_injected_desync_is_detected() {
        let config = RigConfig {
            players: 3,
            ticks: 200,
            desync_at: Some(DesyncInjection { peer: 1, tick: 50 }),
            sync: SyncConfig {
                hash_interval_ticks: 10,
                ..SyncConfig::default()
            },
            ..RigConfig::default()
        };
        let outcome = run_lockstep_match(&config).await.unwrap();
        assert!(!outcome.in_sync());
        assert_eq!(outcome.first_desync_tick(), Some(50));
        for peer in &outcome.peers {
            let first = &peer.desyncs[0];
            assert_eq!(first.tick, 50);
            assert_eq!(first.hashes.len(), 3);
        }
    }

    #[tokio::test]
    async fn test_recording_matches_host() {
        let config = RigConfig {
            ticks: 120,
            record: true,
            ..RigConfig::default()
        };
        let outcome = run_lockstep_match(&config).await.unwrap();
        let recording = outcome.recording.as_ref().unwrap();
        assert_eq!(recording.seed, 12345);
        assert_eq!(recording.final_tick, 120);
        assert_eq!(recording.final_hash, outcome.peers[0].final_hash);
        assert!(recording.checkpoints.contains_key(&0));
        assert!(recording.checkpoints.contains_key(&60));
    }
}
