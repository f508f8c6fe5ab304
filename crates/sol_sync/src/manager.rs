//! Match lifecycle and the per-tick API used by the simulation loop.
//!
//! [`NetworkManager`] owns every piece of per-match state: the validator,
//! the command queue, the pending buffer, the state verifier and the
//! transport. It is driven from a single thread:
//!
//! - Transport handlers only push into channels owned by the manager.
//! - [`NetworkManager::poll`] drains lifecycle signals (readiness,
//!   disconnects) and enforces the connection deadline and stall watchdog.
//! - [`NetworkManager::get_next_tick_commands`] drains inbound commands and
//!   pulls the next resolved tick.
//!
//! Network arrival never advances the simulation by itself.
//!
//! Each peer closes every tick with exactly one [`Command::Noop`] after its
//! real commands. The manager sends that marker automatically the first time
//! the simulation asks for a tick. Input submitted after the marker is
//! stamped for the following tick.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::command::{Command, GameCommand, MatchId, PlayerId, TickCommands};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EndReason, ErrorCause, EventBus, NetworkEvent};
use crate::queue::{CommandQueue, QueueStats};
use crate::rng::{generate_seed, SeededRng};
use crate::store::{CreateMatchOptions, Match, MatchPlayer, MatchStatus, MatchStore, NewMatch};
use crate::transport::{Transport, TransportContext, TransportFactory, TransportStats};
use crate::validator::{CommandValidator, ValidationRules};
use crate::verifier::{StateVerifier, VerifierStats};

/// Lifecycle phase of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    /// No match yet.
    Uninitialized,
    /// Created or joined, waiting for `start_match`.
    Open,
    /// Transport handshake in progress.
    Connecting,
    /// Transport ready, ticks flowing.
    Active,
    /// Terminal.
    Ended,
}

/// Diagnostic snapshot of the manager and its components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Current phase.
    pub phase: MatchPhase,
    /// Local tick counter.
    pub current_tick: u64,
    /// Commands buffered until the transport is ready.
    pub pending_commands: usize,
    /// Gameplay commands sent by this peer.
    pub commands_sent: u64,
    /// Remote gameplay commands accepted.
    pub commands_received: u64,
    /// Commands rejected by the validator, local or remote.
    pub commands_rejected: u64,
    /// Queue snapshot, once started.
    pub queue: Option<QueueStats>,
    /// Verifier counters, when verification is enabled.
    pub verifier: Option<VerifierStats>,
    /// Transport diagnostics, when the transport reports any.
    pub transport: Option<TransportStats>,
}

/// Lifecycle notification pushed by transport handlers.
#[derive(Debug)]
enum Signal {
    Ready,
    Disconnected(Option<PlayerId>),
}

/// Failure surfaced as an `Error` event.
#[derive(Debug)]
struct Failure {
    cause: ErrorCause,
    message: String,
}

impl Failure {
    fn new(cause: ErrorCause, message: impl Into<String>) -> Self {
        Self {
            cause,
            message: message.into(),
        }
    }
}

impl From<SyncError> for Failure {
    fn from(err: SyncError) -> Self {
        let cause = match &err {
            SyncError::InvalidPhase { .. } => ErrorCause::InvalidPhase,
            SyncError::Transport(_) => ErrorCause::TransportFailure,
            SyncError::Store(_) => ErrorCause::Persistence,
            other => ErrorCause::Internal(other.to_string()),
        };
        Self::new(cause, err.to_string())
    }
}

/// Orchestrates one peer's participation in a lockstep match.
pub struct NetworkManager<S: MatchStore, F: TransportFactory> {
    local_player: PlayerId,
    config: SyncConfig,
    store: S,
    factory: F,
    events: EventBus,

    phase: MatchPhase,
    current_match: Option<Match>,
    is_host: bool,
    roster: Vec<PlayerId>,

    current_tick: u64,
    /// Highest tick already closed with the local no-op marker.
    sealed_through: Option<u64>,

    validator: Option<CommandValidator>,
    queue: Option<CommandQueue>,
    verifier: Option<StateVerifier>,
    transport: Option<Box<dyn Transport>>,
    pending: Vec<GameCommand>,

    inbound: Option<UnboundedReceiver<GameCommand>>,
    signals: Option<UnboundedReceiver<Signal>>,
    connection_deadline: Option<Instant>,
    /// Tick the watchdog is timing, and when it started waiting.
    stall: Option<(u64, Instant)>,

    commands_sent: u64,
    commands_received: u64,
    commands_rejected: u64,
}

impl<S: MatchStore, F: TransportFactory> std::fmt::Debug for NetworkManager<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("local_player", &self.local_player)
            .field("phase", &self.phase)
            .field("current_tick", &self.current_tick)
            .field("is_host", &self.is_host)
            .finish_non_exhaustive()
    }
}

impl<S: MatchStore, F: TransportFactory> NetworkManager<S, F> {
    /// Create a manager for `local_player`.
    pub fn new(local_player: PlayerId, store: S, factory: F, config: SyncConfig) -> Self {
        Self {
            local_player,
            config,
            store,
            factory,
            events: EventBus::new(),
            phase: MatchPhase::Uninitialized,
            current_match: None,
            is_host: false,
            roster: Vec::new(),
            current_tick: 0,
            sealed_through: None,
            validator: None,
            queue: None,
            verifier: None,
            transport: None,
            pending: Vec::new(),
            inbound: None,
            signals: None,
            connection_deadline: None,
            stall: None,
            commands_sent: 0,
            commands_received: 0,
            commands_rejected: 0,
        }
    }

    // ========================================
    // Accessors
    // ========================================

    /// Current lifecycle phase.
    #[must_use]
    pub const fn phase(&self) -> MatchPhase {
        self.phase
    }

    /// Local tick counter.
    #[must_use]
    pub const fn current_tick(&self) -> u64 {
        self.current_tick
    }

    /// This peer's player id.
    #[must_use]
    pub const fn local_player_id(&self) -> &PlayerId {
        &self.local_player
    }

    /// The match created or joined, if any.
    #[must_use]
    pub const fn current_match(&self) -> Option<&Match> {
        self.current_match.as_ref()
    }

    /// True when this peer created the current match.
    #[must_use]
    pub const fn is_host(&self) -> bool {
        self.is_host
    }

    /// Every player of the started match, sorted.
    #[must_use]
    pub fn roster(&self) -> &[PlayerId] {
        &self.roster
    }

    /// Configuration in force.
    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// A fresh generator seeded from the match seed.
    ///
    /// Every peer of a match gets an identical sequence from this.
    #[must_use]
    pub fn create_rng(&self) -> Option<SeededRng> {
        self.current_match
            .as_ref()
            .map(|m| SeededRng::new(m.game_seed))
    }

    /// Event bus, for subscribing.
    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    /// Diagnostic snapshot.
    #[must_use]
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            phase: self.phase,
            current_tick: self.current_tick,
            pending_commands: self.pending.len(),
            commands_sent: self.commands_sent,
            commands_received: self.commands_received,
            commands_rejected: self.commands_rejected,
            queue: self.queue.as_ref().map(CommandQueue::stats),
            verifier: self.verifier.as_ref().map(StateVerifier::stats),
            transport: self.transport.as_ref().and_then(|t| t.stats()),
        }
    }

    // ========================================
    // Lobby
    // ========================================

    /// Create a match as host. Returns `None` and emits `Error` on failure.
    pub async fn create_match(&mut self, options: CreateMatchOptions) -> Option<Match> {
        match self.try_create_match(options).await {
            Ok(created) => Some(created),
            Err(failure) => {
                self.fail(failure);
                None
            }
        }
    }

    async fn try_create_match(
        &mut self,
        options: CreateMatchOptions,
    ) -> std::result::Result<Match, Failure> {
        self.require_idle("create_match")?;
        if options.max_players == 0 {
            return Err(Failure::new(
                ErrorCause::CreateFailed,
                "Match must allow at least one player",
            ));
        }
        if options.tick_rate == 0 {
            return Err(Failure::new(
                ErrorCause::CreateFailed,
                "Tick rate must be positive",
            ));
        }

        let game_seed = options.seed.unwrap_or_else(generate_seed);
        let created = self
            .store
            .create_match(NewMatch {
                host_player_id: self.local_player.clone(),
                game_seed,
                options,
            })
            .await
            .map_err(|err| {
                Failure::new(
                    ErrorCause::CreateFailed,
                    format!("Failed to create match: {err}"),
                )
            })?;
        self.store
            .insert_player(
                &created.id,
                MatchPlayer::new(self.local_player.clone(), 0, true),
            )
            .await
            .map_err(|err| {
                Failure::new(
                    ErrorCause::CreateFailed,
                    format!("Failed to seat host: {err}"),
                )
            })?;

        info!(match_id = %created.id, seed = game_seed, "Match created");
        self.adopt_match(created.clone(), true);
        self.emit(NetworkEvent::MatchCreated {
            matched: created.clone(),
        });
        self.emit(NetworkEvent::PlayerJoined {
            match_id: created.id.clone(),
            player_id: self.local_player.clone(),
        });
        Ok(created)
    }

    /// Join an open match. Returns `false` and emits `Error` on failure.
    ///
    /// Joining a match this player already sits in succeeds without a new seat.
    pub async fn join_match(&mut self, match_id: &MatchId) -> bool {
        match self.try_join_match(match_id).await {
            Ok(()) => true,
            Err(failure) => {
                self.fail(failure);
                false
            }
        }
    }

    async fn try_join_match(&mut self, match_id: &MatchId) -> std::result::Result<(), Failure> {
        if self.phase == MatchPhase::Open
            && self.current_match.as_ref().is_some_and(|m| &m.id == match_id)
        {
            return Ok(());
        }
        self.require_idle("join_match")?;

        let found = self
            .store
            .get_match(match_id)
            .await
            .map_err(|err| Failure::new(ErrorCause::JoinFailed, format!("Failed to join: {err}")))?
            .ok_or_else(|| {
                Failure::new(ErrorCause::MatchNotFound, format!("Match {match_id} not found"))
            })?;
        if found.status != MatchStatus::Open {
            return Err(Failure::new(
                ErrorCause::MatchNotOpen,
                "Match is no longer accepting players",
            ));
        }

        let players = self
            .store
            .list_players(match_id)
            .await
            .map_err(|err| Failure::new(ErrorCause::JoinFailed, format!("Failed to join: {err}")))?;
        if players.iter().any(|p| p.player_id == self.local_player) {
            debug!(match_id = %match_id, "Already seated, rejoining");
            let is_host = found.host_player_id == self.local_player;
            self.adopt_match(found, is_host);
            return Ok(());
        }
        if players.len() >= found.max_players {
            return Err(Failure::new(ErrorCause::MatchFull, "Match is full"));
        }

        let seat = (0..)
            .find(|seat| players.iter().all(|p| p.seat != *seat))
            .unwrap_or(players.len());
        self.store
            .insert_player(
                match_id,
                MatchPlayer::new(self.local_player.clone(), seat, false),
            )
            .await
            .map_err(|err| Failure::new(ErrorCause::JoinFailed, format!("Failed to join: {err}")))?;

        info!(match_id = %match_id, seat, seed = found.game_seed, "Joined match");
        let is_host = found.host_player_id == self.local_player;
        self.adopt_match(found, is_host);
        self.emit(NetworkEvent::PlayerJoined {
            match_id: match_id.clone(),
            player_id: self.local_player.clone(),
        });
        Ok(())
    }

    /// Matches accepting players. Empty on failure, with an `Error` event.
    pub async fn list_open_matches(&mut self) -> Vec<Match> {
        match self.store.list_open_matches().await {
            Ok(matches) => matches,
            Err(err) => {
                self.fail(Failure::new(
                    ErrorCause::ListFailed,
                    format!("Failed to list matches: {err}"),
                ));
                Vec::new()
            }
        }
    }

    // ========================================
    // Connection
    // ========================================

    /// Begin connecting to the other players.
    ///
    /// The host closes the lobby, which freezes the roster. A client fails
    /// with `StartFailed` and stays `Open` until the host has done so, and
    /// may retry. Builds the queue over the full roster, opens the transport
    /// and arms the connection deadline. Returns `false` and emits `Error`
    /// on failure.
    pub async fn start_match(&mut self) -> bool {
        self.start_match_at(Instant::now()).await
    }

    /// [`start_match`](Self::start_match) with an explicit clock reading.
    pub async fn start_match_at(&mut self, now: Instant) -> bool {
        match self.try_start_match(now).await {
            Ok(started) => started,
            Err(failure) => {
                self.fail(failure);
                false
            }
        }
    }

    /// `Ok(false)` means the failure was already reported and the match ended.
    async fn try_start_match(&mut self, now: Instant) -> std::result::Result<bool, Failure> {
        self.require_phase("start_match", MatchPhase::Open)?;
        let current = self
            .current_match
            .clone()
            .ok_or_else(|| Failure::new(ErrorCause::StartFailed, "No match to start"))?;

        // The host closes the lobby before reading the roster. Clients read
        // it only after that, so every peer sees the same frozen list.
        let status = if self.is_host {
            self.store
                .update_match_status(&current.id, MatchStatus::Connecting)
                .await
                .map_err(|err| {
                    Failure::new(ErrorCause::StartFailed, format!("Failed to close lobby: {err}"))
                })?;
            MatchStatus::Connecting
        } else {
            self.stored_status(&current.id).await?
        };
        match status {
            MatchStatus::Open => {
                return Err(Failure::new(
                    ErrorCause::StartFailed,
                    format!("Host has not started match {} yet", current.id),
                ));
            }
            MatchStatus::Ended => {
                return Err(Failure::new(
                    ErrorCause::StartFailed,
                    format!("Match {} has already ended", current.id),
                ));
            }
            MatchStatus::Connecting | MatchStatus::Active => {}
        }
        if let Some(adopted) = self.current_match.as_mut() {
            adopted.status = status;
        }

        let players = self
            .store
            .list_players(&current.id)
            .await
            .map_err(|err| {
                Failure::new(ErrorCause::StartFailed, format!("Failed to load roster: {err}"))
            })?;
        let roster: BTreeSet<PlayerId> = players.into_iter().map(|p| p.player_id).collect();
        if !roster.contains(&self.local_player) {
            return Err(Failure::new(
                ErrorCause::StartFailed,
                format!("{} is not seated in match {}", self.local_player, current.id),
            ));
        }
        self.roster = roster.into_iter().collect();

        let rules = ValidationRules::from_config(&self.config, current.game_settings.map_half_extent)
            .with_roster(self.roster.iter().cloned());
        self.validator = Some(CommandValidator::new(rules));
        self.queue = Some(CommandQueue::new(self.roster.iter().cloned()));
        self.current_tick = 0;
        self.sealed_through = None;

        self.phase = MatchPhase::Connecting;
        info!(match_id = %current.id, players = self.roster.len(), "Connecting to peers");
        self.emit(NetworkEvent::Connecting {
            match_id: current.id.clone(),
        });

        let ctx = TransportContext {
            match_id: current.id.clone(),
            local_player: self.local_player.clone(),
            roster: self.roster.clone(),
            is_host: self.is_host,
        };
        let mut transport = match self.factory.connect(&ctx) {
            Ok(transport) => transport,
            Err(err) => {
                self.fail(Failure::new(
                    ErrorCause::TransportFailure,
                    format!("Failed to open transport: {err}"),
                ));
                self.end_match(EndReason::TransportFailure).await;
                return Ok(false);
            }
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        transport.on_command_received(Box::new(move |command| {
            if command_tx.send(command).is_err() {
                debug!("Inbound command after teardown dropped");
            }
        }));
        let ready_tx = signal_tx.clone();
        transport.on_ready(Box::new(move || {
            if ready_tx.send(Signal::Ready).is_err() {
                debug!("Readiness after teardown dropped");
            }
        }));
        transport.on_disconnected(Box::new(move |player| {
            if signal_tx.send(Signal::Disconnected(player)).is_err() {
                debug!("Disconnect after teardown dropped");
            }
        }));

        self.transport = Some(transport);
        self.inbound = Some(command_rx);
        self.signals = Some(signal_rx);
        self.connection_deadline = Some(now + self.config.connection_timeout());

        self.process_signals().await;
        Ok(true)
    }

    /// Handle queued transport signals and enforce timeouts.
    ///
    /// Call once per frame. Never resolves ticks.
    pub async fn poll(&mut self) {
        self.poll_at(Instant::now()).await;
    }

    /// [`poll`](Self::poll) with an explicit clock reading.
    pub async fn poll_at(&mut self, now: Instant) {
        if !matches!(self.phase, MatchPhase::Connecting | MatchPhase::Active) {
            return;
        }
        self.process_signals().await;

        if self.phase == MatchPhase::Connecting
            && self.connection_deadline.is_some_and(|deadline| now >= deadline)
        {
            self.fail(Failure::new(
                ErrorCause::ConnectionTimeout,
                format!(
                    "Connection timed out after {}ms waiting for peers",
                    self.config.connection_timeout_ms
                ),
            ));
            self.end_match(EndReason::ConnectionTimeout).await;
            return;
        }

        if self.phase == MatchPhase::Active {
            self.drain_inbound();
            self.check_stall(now).await;
        }
    }

    /// Wait until the transport is ready or the match ends.
    ///
    /// Returns `true` once active.
    pub async fn wait_until_active(&mut self) -> bool {
        loop {
            self.poll().await;
            if self.phase != MatchPhase::Connecting {
                return self.phase == MatchPhase::Active;
            }
            let (Some(deadline), Some(signals)) =
                (self.connection_deadline, self.signals.as_mut())
            else {
                return false;
            };

            let next = tokio::select! {
                signal = signals.recv() => Some(signal),
                () = tokio::time::sleep_until(deadline) => None,
            };
            match next {
                Some(Some(signal)) => self.handle_signal(signal).await,
                Some(None) => {
                    self.fail(Failure::new(
                        ErrorCause::TransportFailure,
                        "Transport went away while connecting",
                    ));
                    self.end_match(EndReason::TransportFailure).await;
                    return false;
                }
                // Deadline reached, the next poll ends the match
                None => {}
            }
        }
    }

    // ========================================
    // Per-tick API
    // ========================================

    /// Submit local input for the next open tick.
    ///
    /// Invalid commands are logged and dropped. Before the transport is
    /// ready the command is buffered and flushed, in order, on readiness.
    pub fn send_command(&mut self, command: Command) -> bool {
        if !matches!(self.phase, MatchPhase::Connecting | MatchPhase::Active) {
            warn!(phase = ?self.phase, command = command.type_name(), "No started match, command dropped");
            return false;
        }
        if command.is_noop() {
            // Tick markers are sent by the manager itself
            return true;
        }

        let tick = self.input_tick();
        let command = GameCommand::new(tick, self.local_player.clone(), command);
        if let Some(validator) = &self.validator {
            if let Err(err) = validator.validate(&command) {
                warn!(tick, command = command.command_type(), error = %err, "Rejected local command");
                self.commands_rejected += 1;
                return false;
            }
        }

        if self.phase == MatchPhase::Active {
            self.dispatch_local(command);
        } else {
            debug!(tick, command = command.command_type(), "Transport not ready, buffering command");
            self.pending.push(command);
        }
        true
    }

    /// Resolve the current tick if every player has closed it.
    ///
    /// Returns `None` before the match is active and while waiting on peers.
    pub fn get_next_tick_commands(&mut self) -> Option<TickCommands> {
        if self.phase != MatchPhase::Active {
            return None;
        }
        self.drain_inbound();

        if self.sealed_through.map_or(true, |sealed| sealed < self.current_tick) {
            let marker = GameCommand::new(self.current_tick, self.local_player.clone(), Command::Noop);
            self.dispatch_local(marker);
            self.sealed_through = Some(self.current_tick);
        }

        let resolved = self.queue.as_mut()?.next_tick_commands();
        if resolved.is_some() {
            self.stall = None;
        }
        resolved
    }

    /// Move to the next tick once the current one has been applied.
    pub fn advance_tick(&mut self) {
        let resolved = self
            .queue
            .as_ref()
            .is_some_and(|queue| queue.next_tick() > self.current_tick);
        if !resolved {
            warn!(tick = self.current_tick, "Cannot advance past an unresolved tick");
            return;
        }
        self.current_tick += 1;
    }

    /// Share the hash of local state at the current tick.
    ///
    /// Call after applying the tick's commands and before advancing. Does
    /// nothing when verification is disabled.
    pub fn submit_state_hash(&mut self, hash: u64) {
        let tick = self.current_tick;
        let report = match (self.verifier.as_mut(), self.transport.as_deref_mut()) {
            (Some(verifier), Some(transport)) => verifier.submit_hash(tick, hash, transport),
            _ => return,
        };
        if let Some(report) = report {
            self.emit(NetworkEvent::DesyncDetected { report });
        }
    }

    /// Tear everything down and emit `MatchEnded`. Safe to call repeatedly.
    pub async fn end_match(&mut self, reason: EndReason) {
        if matches!(self.phase, MatchPhase::Uninitialized | MatchPhase::Ended) {
            debug!(phase = ?self.phase, %reason, "No live match to end");
            return;
        }
        self.phase = MatchPhase::Ended;

        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
        }
        if let Some(queue) = self.queue.as_mut() {
            queue.clear();
        }
        if let Some(verifier) = self.verifier.as_mut() {
            verifier.clear();
        }
        self.verifier = None;
        self.pending.clear();
        self.inbound = None;
        self.signals = None;
        self.connection_deadline = None;
        self.stall = None;

        self.write_status(MatchStatus::Ended).await;

        let match_id = self
            .current_match
            .as_ref()
            .map(|m| m.id.clone())
            .unwrap_or_else(|| MatchId::new(""));
        info!(match_id = %match_id, %reason, tick = self.current_tick, "Match ended");
        self.emit(NetworkEvent::MatchEnded { match_id, reason });
    }

    // ========================================
    // Internals
    // ========================================

    fn require_phase(&self, operation: &'static str, expected: MatchPhase) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(SyncError::InvalidPhase {
                operation,
                phase: self.phase,
            })
        }
    }

    fn require_idle(&self, operation: &'static str) -> Result<()> {
        if matches!(self.phase, MatchPhase::Uninitialized | MatchPhase::Ended) {
            Ok(())
        } else {
            Err(SyncError::InvalidPhase {
                operation,
                phase: self.phase,
            })
        }
    }

    fn adopt_match(&mut self, adopted: Match, is_host: bool) {
        self.current_match = Some(adopted);
        self.is_host = is_host;
        self.phase = MatchPhase::Open;
        self.roster.clear();
        self.current_tick = 0;
        self.sealed_through = None;
        self.queue = None;
        self.validator = None;
        self.verifier = None;
        self.pending.clear();
    }

    /// Earliest tick local input may still target.
    fn input_tick(&self) -> u64 {
        match self.sealed_through {
            Some(sealed) if sealed >= self.current_tick => sealed + 1,
            _ => self.current_tick,
        }
    }

    /// Queue a local command and transmit it.
    fn dispatch_local(&mut self, command: GameCommand) {
        let gameplay = !command.command().is_noop();
        if let Some(queue) = self.queue.as_mut() {
            queue.add_command(command.clone());
        }
        match self.transport.as_mut() {
            Some(transport) => {
                if let Err(err) = transport.send_command(&command) {
                    warn!(tick = command.tick(), error = %err, "Failed to transmit command");
                } else if gameplay {
                    self.commands_sent += 1;
                }
            }
            None => warn!(tick = command.tick(), "No transport, command kept local"),
        }
    }

    fn drain_inbound(&mut self) {
        let received: Vec<GameCommand> = match self.inbound.as_mut() {
            Some(rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
            None => return,
        };
        for command in received {
            self.handle_inbound(command);
        }
    }

    fn handle_inbound(&mut self, command: GameCommand) {
        if command.player_id() == &self.local_player {
            debug!(tick = command.tick(), "Ignoring echo of a local command");
            return;
        }

        if let Command::StateHash { hash } = command.command() {
            let horizon = self
                .current_tick
                .saturating_add(self.config.hash_interval_ticks.max(1))
                .min(self.config.max_tick);
            if command.tick() > horizon {
                warn!(
                    tick = command.tick(),
                    horizon,
                    player = %command.player_id(),
                    "Rejected state hash beyond the local horizon"
                );
                self.commands_rejected += 1;
                return;
            }
            let report = self.verifier.as_mut().and_then(|verifier| {
                verifier.receive_hash(command.tick(), command.player_id().clone(), *hash)
            });
            if let Some(report) = report {
                self.emit(NetworkEvent::DesyncDetected { report });
            }
            return;
        }

        if let Some(validator) = &self.validator {
            if let Err(err) = validator.validate(&command) {
                warn!(
                    tick = command.tick(),
                    player = %command.player_id(),
                    command = command.command_type(),
                    error = %err,
                    "Rejected remote command"
                );
                self.commands_rejected += 1;
                return;
            }
        }

        let accepted = self
            .queue
            .as_mut()
            .is_some_and(|queue| queue.add_command(command.clone()));
        if accepted && !command.command().is_noop() {
            self.commands_received += 1;
            self.emit(NetworkEvent::CommandReceived { command });
        }
    }

    async fn process_signals(&mut self) {
        let signals: Vec<Signal> = match self.signals.as_mut() {
            Some(rx) => std::iter::from_fn(|| rx.try_recv().ok()).collect(),
            None => return,
        };
        for signal in signals {
            self.handle_signal(signal).await;
            if self.phase == MatchPhase::Ended {
                break;
            }
        }
    }

    async fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Ready => self.activate().await,
            Signal::Disconnected(player) => self.handle_disconnect(player).await,
        }
    }

    /// Transition into `Active`. Repeated readiness is ignored.
    async fn activate(&mut self) {
        if self.phase != MatchPhase::Connecting {
            debug!(phase = ?self.phase, "Duplicate readiness ignored");
            return;
        }
        self.phase = MatchPhase::Active;
        self.connection_deadline = None;

        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            debug!(count = pending.len(), "Flushing commands buffered before readiness");
        }
        for command in pending {
            self.dispatch_local(command);
        }

        let Some(current) = self.current_match.clone() else {
            return;
        };
        if current.lockstep_enabled {
            self.verifier = Some(StateVerifier::new(
                self.local_player.clone(),
                self.roster.iter().cloned(),
                self.config.resolved_hash_history,
            ));
        }
        self.write_status(MatchStatus::Active).await;

        info!(match_id = %current.id, seed = current.game_seed, "Match started");
        self.emit(NetworkEvent::Connected {
            match_id: current.id.clone(),
        });
        self.emit(NetworkEvent::MatchStarted {
            match_id: current.id,
            seed: current.game_seed,
        });
    }

    async fn handle_disconnect(&mut self, player: Option<PlayerId>) {
        if !matches!(self.phase, MatchPhase::Connecting | MatchPhase::Active) {
            return;
        }
        let match_id = self
            .current_match
            .as_ref()
            .map(|m| m.id.clone())
            .unwrap_or_else(|| MatchId::new(""));

        let message = match &player {
            Some(left) => {
                self.emit(NetworkEvent::PlayerLeft {
                    match_id,
                    player_id: left.clone(),
                });
                format!("Player {left} disconnected")
            }
            None => "Connection to peers lost".to_string(),
        };
        self.emit(NetworkEvent::Disconnected { player_id: player });
        self.fail(Failure::new(ErrorCause::RemoteDisconnect, message));
        self.end_match(EndReason::RemoteDisconnect).await;
    }

    async fn check_stall(&mut self, now: Instant) {
        let (Some(limit), Some(queue)) = (self.config.stall_timeout(), self.queue.as_ref()) else {
            return;
        };
        let tick = queue.next_tick();
        let missing: Vec<PlayerId> = queue
            .missing_players(tick)
            .into_iter()
            .filter(|player| player != &self.local_player)
            .collect();
        if missing.is_empty() {
            self.stall = None;
            return;
        }

        match self.stall {
            Some((stalled, since)) if stalled == tick => {
                if now.saturating_duration_since(since) < limit {
                    return;
                }
                let names: Vec<&str> = missing.iter().map(PlayerId::as_str).collect();
                self.fail(Failure::new(
                    ErrorCause::TickStall,
                    format!(
                        "Tick {tick} stalled for over {}ms waiting for {}",
                        limit.as_millis(),
                        names.join(", ")
                    ),
                ));
                self.end_match(EndReason::TickStallTimeout).await;
            }
            _ => self.stall = Some((tick, now)),
        }
    }

    /// Persist a status change. Only the host writes match status.
    async fn stored_status(
        &self,
        match_id: &MatchId,
    ) -> std::result::Result<MatchStatus, Failure> {
        self.store
            .get_match(match_id)
            .await
            .map_err(|err| {
                Failure::new(ErrorCause::StartFailed, format!("Failed to load match: {err}"))
            })?
            .map(|stored| stored.status)
            .ok_or_else(|| {
                Failure::new(ErrorCause::StartFailed, format!("Match {match_id} not found"))
            })
    }

    async fn write_status(&mut self, status: MatchStatus) {
        if !self.is_host {
            return;
        }
        let Some(match_id) = self.current_match.as_ref().map(|m| m.id.clone()) else {
            return;
        };
        match self.store.update_match_status(&match_id, status).await {
            Ok(()) => {
                if let Some(current) = self.current_match.as_mut() {
                    current.status = status;
                }
            }
            Err(err) => self.fail(Failure::new(
                ErrorCause::Persistence,
                format!("Failed to update match status: {err}"),
            )),
        }
    }

    fn fail(&mut self, failure: Failure) {
        warn!(cause = ?failure.cause, message = %failure.message, "Network error");
        self.emit(NetworkEvent::Error {
            cause: failure.cause,
            message: failure.message,
        });
    }

    fn emit(&mut self, event: NetworkEvent) {
        self.events.emit(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::math::Vec2Fixed;
    use crate::store::MemoryMatchStore;
    use crate::transport::LoopbackNetwork;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    type Manager = NetworkManager<MemoryMatchStore, LoopbackNetwork>;

    fn manager(id: &str, store: &MemoryMatchStore, network: &LoopbackNetwork) -> Manager {
        NetworkManager::new(
            PlayerId::from(id),
            store.clone(),
            network.clone(),
            SyncConfig::default(),
        )
    }

    fn record(manager: &mut Manager) -> Rc<RefCell<Vec<NetworkEvent>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&events);
        manager
            .events_mut()
            .subscribe_all(move |event| sink.borrow_mut().push(event.clone()));
        events
    }

    fn kinds(events: &Rc<RefCell<Vec<NetworkEvent>>>) -> Vec<EventKind> {
        events.borrow().iter().map(NetworkEvent::kind).collect()
    }

    fn options(max_players: usize) -> CreateMatchOptions {
        CreateMatchOptions {
            max_players,
            seed: Some(12345),
            ..CreateMatchOptions::default()
        }
    }

    fn move_to(x: i32, y: i32) -> Command {
        Command::MoveUnits {
            unit_ids: vec![1],
            target: Vec2Fixed::from_ints(x, y),
        }
    }

    #[tokio::test]
    async fn test_create_match_emits_and_opens() {
        let store = MemoryMatchStore::new();
        let network = LoopbackNetwork::new();
        let mut host = manager("host", &store, &network);
        let events = record(&mut host);

        let created = host.create_match(options(2)).await.unwrap();
        assert_eq!(created.game_seed, 12345);
        assert_eq!(host.phase(), MatchPhase::Open);
        assert!(host.is_host());
        assert_eq!(
            kinds(&events),
            vec![EventKind::MatchCreated, EventKind::PlayerJoined]
        );
        assert_eq!(host.create_rng(), Some(SeededRng::new(12345)));
    }

    #[tokio::test]
    async fn test_create_twice_is_rejected() {
        let store = MemoryMatchStore::new();
        let mut host = manager("host", &store, &LoopbackNetwork::new());
        let events = record(&mut host);
        host.create_match(options(2)).await.unwrap();
        assert!(host.create_match(options(2)).await.is_none());
        assert!(matches!(
            events.borrow().last(),
            Some(NetworkEvent::Error {
                cause: ErrorCause::InvalidPhase,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_store_failure_becomes_error_event() {
        let store = MemoryMatchStore::new();
        store.set_failing(true);
        let mut host = manager("host", &store, &LoopbackNetwork::new());
        let events = record(&mut host);
        assert!(host.create_match(options(2)).await.is_none());
        assert_eq!(host.phase(), MatchPhase::Uninitialized);
        assert!(matches!(
            &events.borrow()[0],
            NetworkEvent::Error {
                cause: ErrorCause::CreateFailed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_join_errors_are_distinct() {
        let store = MemoryMatchStore::new();
        let network = LoopbackNetwork::new();
        let mut host = manager("host", &store, &network);
        let created = host.create_match(options(1)).await.unwrap();

        let mut guest = manager("guest", &store, &network);
        let events = record(&mut guest);
        assert!(!guest.join_match(&MatchId::from("nope")).await);
        assert!(!guest.join_match(&created.id).await);

        let messages: Vec<(ErrorCause, String)> = events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                NetworkEvent::Error { cause, message } => Some((cause.clone(), message.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(messages[0].0, ErrorCause::MatchNotFound);
        assert!(messages[0].1.contains("not found"));
        assert_eq!(messages[1].0, ErrorCause::MatchFull);
        assert!(messages[1].1.contains("full"));
    }

    #[tokio::test]
    async fn test_join_closed_match_and_rejoin() {
        let store = MemoryMatchStore::new();
        let network = LoopbackNetwork::new();
        let mut host = manager("host", &store, &network);
        let created = host.create_match(options(3)).await.unwrap();

        let mut guest = manager("guest", &store, &network);
        assert!(guest.join_match(&created.id).await);
        assert!(guest.join_match(&created.id).await);
        assert_eq!(store.list_players(&created.id).await.unwrap().len(), 2);
        assert!(!guest.is_host());
        assert_eq!(guest.create_rng(), host.create_rng());

        store
            .update_match_status(&created.id, MatchStatus::Active)
            .await
            .unwrap();
        let mut late = manager("late", &store, &network);
        let events = record(&mut late);
        assert!(!late.join_match(&created.id).await);
        assert!(matches!(
            &events.borrow()[0],
            NetworkEvent::Error { cause: ErrorCause::MatchNotOpen, message }
                if message.contains("no longer accepting players")
        ));
    }

    #[tokio::test]
    async fn test_client_start_waits_for_host() {
        let store = MemoryMatchStore::new();
        let network = LoopbackNetwork::new();
        let mut host = manager("host", &store, &network);
        let created = host.create_match(options(3)).await.unwrap();
        let mut guest = manager("guest", &store, &network);
        let events = record(&mut guest);
        assert!(guest.join_match(&created.id).await);

        assert!(!guest.start_match().await);
        assert_eq!(guest.phase(), MatchPhase::Open);
        assert!(guest.roster().is_empty());
        assert!(events.borrow().iter().any(|e| matches!(
            e,
            NetworkEvent::Error { cause: ErrorCause::StartFailed, message }
                if message.contains("not started")
        )));

        assert!(host.start_match().await);
        assert_eq!(
            store.get_match(&created.id).await.unwrap().unwrap().status,
            MatchStatus::Connecting
        );
        assert!(guest.start_match().await);
        assert_eq!(guest.roster(), host.roster());
    }

    #[tokio::test]
    async fn test_nothing_flows_before_start() {
        let store = MemoryMatchStore::new();
        let mut host = manager("host", &store, &LoopbackNetwork::new());
        assert!(host.get_next_tick_commands().is_none());
        assert!(!host.send_command(move_to(1, 1)));
        host.create_match(options(2)).await.unwrap();
        assert!(host.get_next_tick_commands().is_none());
        assert!(host.start_match().await);
        assert_eq!(host.phase(), MatchPhase::Connecting);
        assert!(host.get_next_tick_commands().is_none());
        assert!(host.send_command(move_to(1, 1)));
        assert_eq!(host.stats().pending_commands, 1);
    }

    #[tokio::test]
    async fn test_solo_match_resolves_ticks() {
        let store = MemoryMatchStore::new();
        let mut solo = manager("solo", &store, &LoopbackNetwork::new());
        let events = record(&mut solo);
        solo.create_match(options(1)).await.unwrap();
        assert!(solo.start_match().await);
        assert_eq!(solo.phase(), MatchPhase::Active);
        assert!(kinds(&events).contains(&EventKind::MatchStarted));

        assert!(solo.send_command(move_to(3, 4)));
        let tick = solo.get_next_tick_commands().unwrap();
        assert_eq!(tick.tick, 0);
        assert_eq!(tick.commands.len(), 1);
        assert_eq!(tick.commands[0].command(), &move_to(3, 4));

        // Input after the tick was sealed lands on the next one
        assert!(solo.send_command(move_to(5, 5)));
        solo.advance_tick();
        let next = solo.get_next_tick_commands().unwrap();
        assert_eq!(next.tick, 1);
        assert_eq!(next.commands[0].tick(), 1);
    }

    #[tokio::test]
    async fn test_advance_requires_resolution() {
        let store = MemoryMatchStore::new();
        let network = LoopbackNetwork::new();
        let mut host = manager("host", &store, &network);
        let created = host.create_match(options(2)).await.unwrap();
        let mut guest = manager("guest", &store, &network);
        assert!(guest.join_match(&created.id).await);
        assert!(host.start_match().await);
        assert!(guest.start_match().await);
        host.poll().await;

        assert!(host.get_next_tick_commands().is_none());
        host.advance_tick();
        assert_eq!(host.current_tick(), 0);

        assert!(guest.get_next_tick_commands().is_some());
        assert!(host.get_next_tick_commands().is_some());
        host.advance_tick();
        assert_eq!(host.current_tick(), 1);
    }

    #[tokio::test]
    async fn test_invalid_local_command_rejected() {
        let store = MemoryMatchStore::new();
        let mut solo = manager("solo", &store, &LoopbackNetwork::new());
        solo.create_match(options(1)).await.unwrap();
        solo.start_match().await;
        assert!(!solo.send_command(Command::MoveUnits {
            unit_ids: vec![],
            target: Vec2Fixed::ZERO,
        }));
        assert!(!solo.send_command(Command::StateHash { hash: 1 }));
        assert_eq!(solo.stats().commands_rejected, 2);
        assert!(solo.get_next_tick_commands().unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_connection_timeout() {
        let store = MemoryMatchStore::new();
        let network = LoopbackNetwork::manual();
        let mut host = manager("host", &store, &network);
        let events = record(&mut host);
        host.create_match(options(2)).await.unwrap();

        let start = Instant::now();
        assert!(host.start_match_at(start).await);
        host.poll_at(start + Duration::from_secs(29)).await;
        assert_eq!(host.phase(), MatchPhase::Connecting);

        host.poll_at(start + Duration::from_secs(30)).await;
        assert_eq!(host.phase(), MatchPhase::Ended);
        let seen = events.borrow();
        let tail: Vec<&NetworkEvent> = seen.iter().rev().take(2).collect();
        assert!(matches!(
            tail[1],
            NetworkEvent::Error {
                cause: ErrorCause::ConnectionTimeout,
                ..
            }
        ));
        assert!(matches!(
            tail[0],
            NetworkEvent::MatchEnded {
                reason: EndReason::ConnectionTimeout,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_readiness_cancels_deadline() {
        let store = MemoryMatchStore::new();
        let network = LoopbackNetwork::manual();
        let mut solo = manager("solo", &store, &network);
        solo.create_match(options(1)).await.unwrap();
        let start = Instant::now();
        solo.start_match_at(start).await;
        network.signal_ready();
        solo.poll_at(start + Duration::from_secs(60)).await;
        assert_eq!(solo.phase(), MatchPhase::Active);
    }

    #[tokio::test]
    async fn test_end_match_is_idempotent() {
        let store = MemoryMatchStore::new();
        let mut solo = manager("solo", &store, &LoopbackNetwork::new());
        let events = record(&mut solo);
        solo.end_match(EndReason::UserEnded).await;
        assert!(events.borrow().is_empty());

        let created = solo.create_match(options(1)).await.unwrap();
        solo.start_match().await;
        solo.end_match(EndReason::UserEnded).await;
        solo.end_match(EndReason::UserEnded).await;
        solo.end_match(EndReason::RemoteDisconnect).await;

        let ended = kinds(&events)
            .into_iter()
            .filter(|k| *k == EventKind::MatchEnded)
            .count();
        assert_eq!(ended, 1);
        assert!(solo.get_next_tick_commands().is_none());
        assert_eq!(
            store.get_match(&created.id).await.unwrap().unwrap().status,
            MatchStatus::Ended
        );
    }

    #[tokio::test]
    async fn test_stall_watchdog() {
        let store = MemoryMatchStore::new();
        let network = LoopbackNetwork::new();
        let config = SyncConfig {
            stall_timeout_ms: Some(1_000),
            ..SyncConfig::default()
        };
        let mut host = NetworkManager::new(
            PlayerId::from("host"),
            store.clone(),
            network.clone(),
            config,
        );
        let events = record(&mut host);
        let created = host.create_match(options(2)).await.unwrap();
        let mut guest = manager("guest", &store, &network);
        guest.join_match(&created.id).await;
        host.start_match().await;
        guest.start_match().await;

        let start = Instant::now();
        host.poll_at(start).await;
        assert!(host.get_next_tick_commands().is_none());
        host.poll_at(start + Duration::from_millis(500)).await;
        assert_eq!(host.phase(), MatchPhase::Active);
        host.poll_at(start + Duration::from_millis(1_500)).await;
        assert_eq!(host.phase(), MatchPhase::Ended);
        assert!(events.borrow().iter().any(|e| matches!(
            e,
            NetworkEvent::MatchEnded {
                reason: EndReason::TickStallTimeout,
                ..
            }
        )));
    }
}
