//! Transport abstraction.
//!
//! Any channel that moves commands between peers (peer-to-peer today, a
//! relay later) implements [`Transport`]. The network manager only talks to
//! this trait; concrete signaling lives outside the sync core.
//!
//! Handlers registered on a transport may be invoked from outside the
//! manager's own call stack. They must only record what happened. Tick
//! resolution is always pulled by the simulation loop, never pushed by
//! network arrival.

pub mod loopback;

use serde::{Deserialize, Serialize};

use crate::command::{GameCommand, MatchId, PlayerId};
use crate::error::Result;

pub use loopback::{LoopbackNetwork, LoopbackTransport};

/// Invoked once per inbound command, in arrival order.
pub type CommandHandler = Box<dyn FnMut(GameCommand)>;

/// Invoked when the transport becomes ready.
pub type ReadyHandler = Box<dyn FnMut()>;

/// Invoked when a peer (`Some`) or the whole link (`None`) goes away.
pub type DisconnectHandler = Box<dyn FnMut(Option<PlayerId>)>;

/// Optional diagnostics a transport may report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Peers currently connected, excluding self.
    pub connected_peers: usize,
    /// Messages handed to the link.
    pub messages_sent: u64,
    /// Messages delivered to this endpoint.
    pub messages_received: u64,
    /// Inbound messages dropped because they failed to decode.
    pub messages_dropped: u64,
    /// Last measured round-trip latency, if the link measures it.
    pub latency_ms: Option<u32>,
}

/// A connection to every other peer of a match.
pub trait Transport {
    /// Send a command to all connected peers. Best effort, no acknowledgment.
    fn send_command(&mut self, command: &GameCommand) -> Result<()>;

    /// Register the inbound command handler.
    fn on_command_received(&mut self, handler: CommandHandler);

    /// True once the minimum viable set of peer connections is established.
    fn is_ready(&self) -> bool;

    /// Register the readiness handler.
    ///
    /// Meant to fire once, but callers must tolerate repeated calls.
    fn on_ready(&mut self, handler: ReadyHandler);

    /// Register the disconnect handler.
    fn on_disconnected(&mut self, handler: DisconnectHandler);

    /// Tear down every connection. Safe to call repeatedly or before connecting.
    fn disconnect(&mut self);

    /// Diagnostics, if this transport collects any.
    fn stats(&self) -> Option<TransportStats> {
        None
    }
}

/// What a transport needs to know about the match it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportContext {
    /// Match being connected.
    pub match_id: MatchId,
    /// This peer.
    pub local_player: PlayerId,
    /// Every player in the match, including this peer.
    pub roster: Vec<PlayerId>,
    /// True on the match host.
    pub is_host: bool,
}

/// Builds a transport when a match starts.
pub trait TransportFactory {
    /// Open a transport for the match described by `ctx`.
    fn connect(&mut self, ctx: &TransportContext) -> Result<Box<dyn Transport>>;
}
