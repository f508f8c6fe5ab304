//! In-process transport.
//!
//! [`LoopbackNetwork`] connects every peer of a match living in the same
//! process. Messages go through the real wire codec, are delivered
//! immediately and in send order, and the network can simulate the failure
//! modes the manager has to survive: readiness that never arrives, readiness
//! that fires twice, partitions, dropped peers and garbage on the wire.
//!
//! Used by the headless runner and the integration tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use tracing::{debug, warn};

use super::{
    CommandHandler, DisconnectHandler, ReadyHandler, Transport, TransportContext,
    TransportFactory, TransportStats,
};
use crate::command::{GameCommand, PlayerId};
use crate::error::{Result, SyncError};
use crate::wire;

#[derive(Default)]
struct Endpoint {
    command_handler: Option<CommandHandler>,
    ready_handler: Option<ReadyHandler>,
    disconnect_handler: Option<DisconnectHandler>,
    /// Messages that arrived before a command handler was registered.
    inbox: VecDeque<Vec<u8>>,
    connected: bool,
    ready: bool,
    partitioned: bool,
    stats: TransportStats,
}

#[derive(Default)]
struct Hub {
    endpoints: BTreeMap<PlayerId, Endpoint>,
    roster: Vec<PlayerId>,
    manual_ready: bool,
}

impl Hub {
    fn all_connected(&self) -> bool {
        !self.roster.is_empty()
            && self
                .roster
                .iter()
                .all(|p| self.endpoints.get(p).is_some_and(|e| e.connected))
    }

    fn connected_peers(&self, of: &PlayerId) -> usize {
        self.endpoints
            .iter()
            .filter(|(id, e)| *id != of && e.connected)
            .count()
    }
}

/// Shared in-process link between the peers of one match.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    hub: Rc<RefCell<Hub>>,
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hub = self.hub.borrow();
        f.debug_struct("LoopbackNetwork")
            .field("endpoints", &hub.endpoints.keys().collect::<Vec<_>>())
            .field("manual_ready", &hub.manual_ready)
            .finish()
    }
}

impl LoopbackNetwork {
    /// Network that becomes ready as soon as every roster player has connected.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Network that only becomes ready through [`signal_ready`](Self::signal_ready).
    #[must_use]
    pub fn manual() -> Self {
        let network = Self::default();
        network.hub.borrow_mut().manual_ready = true;
        network
    }

    /// Open an endpoint for `ctx.local_player`.
    ///
    /// The first endpoint fixes the match roster. Later endpoints must bring
    /// the same roster and belong to it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transport`] when the roster disagrees with the
    /// one already connected.
    pub fn endpoint(&self, ctx: &TransportContext) -> Result<LoopbackTransport> {
        {
            let mut hub = self.hub.borrow_mut();
            if hub.roster.is_empty() {
                hub.roster = ctx.roster.clone();
            } else if hub.roster != ctx.roster {
                warn!(
                    player = %ctx.local_player,
                    expected = ?hub.roster,
                    offered = ?ctx.roster,
                    "Roster mismatch on connect"
                );
                return Err(SyncError::Transport(format!(
                    "{} connected with a roster that differs from its peers",
                    ctx.local_player
                )));
            }
            if !hub.roster.contains(&ctx.local_player) {
                return Err(SyncError::Transport(format!(
                    "{} is not in the match roster",
                    ctx.local_player
                )));
            }
            let endpoint = hub.endpoints.entry(ctx.local_player.clone()).or_default();
            endpoint.connected = true;
            debug!(player = %ctx.local_player, "Loopback endpoint connected");
        }
        let should_ready = {
            let hub = self.hub.borrow();
            !hub.manual_ready && hub.all_connected()
        };
        if should_ready {
            self.mark_all_ready();
        }
        Ok(LoopbackTransport {
            hub: Rc::clone(&self.hub),
            local: ctx.local_player.clone(),
        })
    }

    /// Make every connected endpoint ready, firing handlers that have not fired yet.
    pub fn signal_ready(&self) {
        self.mark_all_ready();
    }

    /// Invoke `player`'s ready handler again, as a misbehaving link would.
    pub fn fire_ready(&self, player: &PlayerId) {
        let handler = {
            let mut hub = self.hub.borrow_mut();
            hub.endpoints.get_mut(player).and_then(|e| {
                e.ready = true;
                e.ready_handler.take()
            })
        };
        if let Some(mut handler) = handler {
            handler();
            self.restore_ready_handler(player, handler);
        }
    }

    /// Drop every message `player` sends until the partition is lifted.
    pub fn set_partitioned(&self, player: &PlayerId, partitioned: bool) {
        if let Some(endpoint) = self.hub.borrow_mut().endpoints.get_mut(player) {
            endpoint.partitioned = partitioned;
        }
    }

    /// Simulate `player` vanishing: its link closes and every peer is told.
    pub fn drop_peer(&self, player: &PlayerId) {
        close_endpoint(&self.hub, player);
    }

    /// Deliver raw bytes to `player` as if a peer had sent them.
    pub fn inject_raw(&self, player: &PlayerId, bytes: Vec<u8>) {
        deliver(&self.hub, player, bytes);
    }

    fn mark_all_ready(&self) {
        let to_fire: Vec<(PlayerId, ReadyHandler)> = {
            let mut hub = self.hub.borrow_mut();
            let mut handlers = Vec::new();
            for (id, endpoint) in &mut hub.endpoints {
                if endpoint.connected && !endpoint.ready {
                    endpoint.ready = true;
                    if let Some(handler) = endpoint.ready_handler.take() {
                        handlers.push((id.clone(), handler));
                    }
                }
            }
            handlers
        };
        for (id, mut handler) in to_fire {
            handler();
            self.restore_ready_handler(&id, handler);
        }
    }

    fn restore_ready_handler(&self, player: &PlayerId, handler: ReadyHandler) {
        if let Some(endpoint) = self.hub.borrow_mut().endpoints.get_mut(player) {
            if endpoint.ready_handler.is_none() {
                endpoint.ready_handler = Some(handler);
            }
        }
    }
}

impl TransportFactory for LoopbackNetwork {
    fn connect(&mut self, ctx: &TransportContext) -> Result<Box<dyn Transport>> {
        Ok(Box::new(self.endpoint(ctx)?))
    }
}

/// One peer's end of a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    hub: Rc<RefCell<Hub>>,
    local: PlayerId,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

impl Transport for LoopbackTransport {
    fn send_command(&mut self, command: &GameCommand) -> Result<()> {
        let bytes = wire::encode(command)?;
        let targets: Vec<PlayerId> = {
            let mut hub = self.hub.borrow_mut();
            let Some(endpoint) = hub.endpoints.get_mut(&self.local) else {
                return Err(SyncError::Transport("endpoint not registered".into()));
            };
            if !endpoint.connected {
                return Err(SyncError::Transport("not connected".into()));
            }
            endpoint.stats.messages_sent += 1;
            if endpoint.partitioned {
                return Ok(());
            }
            hub.endpoints
                .iter()
                .filter(|(id, e)| **id != self.local && e.connected)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for target in targets {
            deliver(&self.hub, &target, bytes.clone());
        }
        Ok(())
    }

    fn on_command_received(&mut self, handler: CommandHandler) {
        let backlog: Vec<Vec<u8>> = {
            let mut hub = self.hub.borrow_mut();
            let Some(endpoint) = hub.endpoints.get_mut(&self.local) else {
                return;
            };
            endpoint.command_handler = Some(handler);
            endpoint.inbox.drain(..).collect()
        };
        for bytes in backlog {
            deliver(&self.hub, &self.local, bytes);
        }
    }

    fn is_ready(&self) -> bool {
        self.hub
            .borrow()
            .endpoints
            .get(&self.local)
            .is_some_and(|e| e.connected && e.ready)
    }

    fn on_ready(&mut self, mut handler: ReadyHandler) {
        let already_ready = self.is_ready();
        if already_ready {
            handler();
        }
        if let Some(endpoint) = self.hub.borrow_mut().endpoints.get_mut(&self.local) {
            endpoint.ready_handler = Some(handler);
        }
    }

    fn on_disconnected(&mut self, handler: DisconnectHandler) {
        if let Some(endpoint) = self.hub.borrow_mut().endpoints.get_mut(&self.local) {
            endpoint.disconnect_handler = Some(handler);
        }
    }

    fn disconnect(&mut self) {
        close_endpoint(&self.hub, &self.local);
    }

    fn stats(&self) -> Option<TransportStats> {
        let hub = self.hub.borrow();
        let endpoint = hub.endpoints.get(&self.local)?;
        let mut stats = endpoint.stats.clone();
        stats.connected_peers = if endpoint.connected {
            hub.connected_peers(&self.local)
        } else {
            0
        };
        stats.latency_ms = Some(0);
        Some(stats)
    }
}

fn deliver(hub: &Rc<RefCell<Hub>>, target: &PlayerId, bytes: Vec<u8>) {
    let handler = {
        let mut hub = hub.borrow_mut();
        let Some(endpoint) = hub.endpoints.get_mut(target) else {
            return;
        };
        if !endpoint.connected {
            return;
        }
        match endpoint.command_handler.take() {
            Some(handler) => handler,
            None => {
                endpoint.inbox.push_back(bytes);
                return;
            }
        }
    };

    let mut handler = handler;
    let decoded = wire::decode(&bytes);
    {
        let mut hub = hub.borrow_mut();
        if let Some(endpoint) = hub.endpoints.get_mut(target) {
            match decoded {
                Ok(_) => endpoint.stats.messages_received += 1,
                Err(ref err) => {
                    endpoint.stats.messages_dropped += 1;
                    warn!(player = %target, error = %err, "Dropping undecodable message");
                }
            }
        }
    }
    if let Ok(command) = decoded {
        handler(command);
    }
    if let Some(endpoint) = hub.borrow_mut().endpoints.get_mut(target) {
        if endpoint.command_handler.is_none() {
            endpoint.command_handler = Some(handler);
        }
    }
}

fn close_endpoint(hub: &Rc<RefCell<Hub>>, player: &PlayerId) {
    let to_notify: Vec<(PlayerId, DisconnectHandler)> = {
        let mut hub = hub.borrow_mut();
        let Some(endpoint) = hub.endpoints.get_mut(player) else {
            return;
        };
        if !endpoint.connected {
            return;
        }
        endpoint.connected = false;
        endpoint.ready = false;
        endpoint.inbox.clear();
        debug!(player = %player, "Loopback endpoint disconnected");

        let mut handlers = Vec::new();
        for (id, other) in &mut hub.endpoints {
            if id != player && other.connected {
                if let Some(handler) = other.disconnect_handler.take() {
                    handlers.push((id.clone(), handler));
                }
            }
        }
        handlers
    };
    for (id, mut handler) in to_notify {
        handler(Some(player.clone()));
        if let Some(endpoint) = hub.borrow_mut().endpoints.get_mut(&id) {
            if endpoint.disconnect_handler.is_none() {
                endpoint.disconnect_handler = Some(handler);
            }
        }
    }
}
