//! Network manager event stream.
//!
//! Component-level happenings (transport readiness, desyncs, timeouts,
//! persistence failures) are turned into a single typed [`NetworkEvent`]
//! stream. Subscribers register per [`EventKind`] or for everything.
//!
//! A listener that panics is isolated: the panic is caught and logged, the
//! remaining listeners still run and the emitting call completes normally.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::command::{GameCommand, MatchId, PlayerId};
use crate::store::Match;
use crate::verifier::DesyncReport;

/// Why a match ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A local user or the embedding application ended the match.
    UserEnded,
    /// The transport never became ready.
    ConnectionTimeout,
    /// A peer or the whole link disconnected mid-match.
    RemoteDisconnect,
    /// The transport could not be created or failed irrecoverably.
    TransportFailure,
    /// A tick waited longer than the configured stall watchdog.
    TickStallTimeout,
}

impl EndReason {
    /// Machine-readable reason code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UserEnded => "user_ended",
            Self::ConnectionTimeout => "connection_timeout",
            Self::RemoteDisconnect => "remote_disconnect",
            Self::TransportFailure => "transport_failure",
            Self::TickStallTimeout => "tick_stall_timeout",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable cause attached to [`NetworkEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    /// Requested match does not exist.
    MatchNotFound,
    /// Match has no free seats.
    MatchFull,
    /// Match is no longer accepting players.
    MatchNotOpen,
    /// Match creation failed in the store.
    CreateFailed,
    /// Joining failed in the store.
    JoinFailed,
    /// Listing matches failed in the store.
    ListFailed,
    /// Starting failed before the transport was up.
    StartFailed,
    /// Operation not allowed in the current phase.
    InvalidPhase,
    /// Transport never became ready.
    ConnectionTimeout,
    /// A peer dropped mid-match.
    RemoteDisconnect,
    /// The transport failed.
    TransportFailure,
    /// A tick stalled beyond the watchdog.
    TickStall,
    /// A status write to the store failed.
    Persistence,
    /// Unexpected internal failure, original cause attached.
    Internal(String),
}

/// Events emitted by the network manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// A match was created by this peer.
    MatchCreated {
        /// The new match.
        matched: Match,
    },
    /// A player took a seat.
    PlayerJoined {
        /// Match joined.
        match_id: MatchId,
        /// Player who joined.
        player_id: PlayerId,
    },
    /// A player left or dropped.
    PlayerLeft {
        /// Match left.
        match_id: MatchId,
        /// Player who left.
        player_id: PlayerId,
    },
    /// Transport handshake started.
    Connecting {
        /// Match being connected.
        match_id: MatchId,
    },
    /// Transport became ready.
    Connected {
        /// Match connected.
        match_id: MatchId,
    },
    /// A peer or the whole link went away.
    Disconnected {
        /// Peer that disconnected, or `None` for the whole link.
        player_id: Option<PlayerId>,
    },
    /// Ticks are flowing.
    MatchStarted {
        /// Match started.
        match_id: MatchId,
        /// Seed all peers derive their RNG from.
        seed: u64,
    },
    /// Terminal event of a match.
    MatchEnded {
        /// Match ended.
        match_id: MatchId,
        /// Why it ended.
        reason: EndReason,
    },
    /// A remote gameplay command was accepted into the queue.
    CommandReceived {
        /// The command.
        command: GameCommand,
    },
    /// Peers disagree on the state of a tick.
    DesyncDetected {
        /// Diagnostic payload.
        report: DesyncReport,
    },
    /// A failure surfaced to the embedding application.
    Error {
        /// Machine-readable cause.
        cause: ErrorCause,
        /// Human-readable message.
        message: String,
    },
}

/// Discriminant of [`NetworkEvent`], used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// [`NetworkEvent::MatchCreated`]
    MatchCreated,
    /// [`NetworkEvent::PlayerJoined`]
    PlayerJoined,
    /// [`NetworkEvent::PlayerLeft`]
    PlayerLeft,
    /// [`NetworkEvent::Connecting`]
    Connecting,
    /// [`NetworkEvent::Connected`]
    Connected,
    /// [`NetworkEvent::Disconnected`]
    Disconnected,
    /// [`NetworkEvent::MatchStarted`]
    MatchStarted,
    /// [`NetworkEvent::MatchEnded`]
    MatchEnded,
    /// [`NetworkEvent::CommandReceived`]
    CommandReceived,
    /// [`NetworkEvent::DesyncDetected`]
    DesyncDetected,
    /// [`NetworkEvent::Error`]
    Error,
}

impl NetworkEvent {
    /// Kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::MatchCreated { .. } => EventKind::MatchCreated,
            Self::PlayerJoined { .. } => EventKind::PlayerJoined,
            Self::PlayerLeft { .. } => EventKind::PlayerLeft,
            Self::Connecting { .. } => EventKind::Connecting,
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::MatchStarted { .. } => EventKind::MatchStarted,
            Self::MatchEnded { .. } => EventKind::MatchEnded,
            Self::CommandReceived { .. } => EventKind::CommandReceived,
            Self::DesyncDetected { .. } => EventKind::DesyncDetected,
            Self::Error { .. } => EventKind::Error,
        }
    }
}

/// Event listener.
pub type Listener = Box<dyn FnMut(&NetworkEvent)>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Typed pub/sub with per-listener panic isolation.
#[derive(Default)]
pub struct EventBus {
    by_kind: BTreeMap<EventKind, Vec<(SubscriptionId, Listener)>>,
    wildcard: Vec<(SubscriptionId, Listener)>,
    next_id: u64,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl EventBus {
    /// Empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen for one kind of event.
    pub fn subscribe<F>(&mut self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: FnMut(&NetworkEvent) + 'static,
    {
        let id = self.allocate_id();
        self.by_kind
            .entry(kind)
            .or_default()
            .push((id, Box::new(listener)));
        id
    }

    /// Listen for every event.
    pub fn subscribe_all<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&NetworkEvent) + 'static,
    {
        let id = self.allocate_id();
        self.wildcard.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listener_count();
        for listeners in self.by_kind.values_mut() {
            listeners.retain(|(sub, _)| *sub != id);
        }
        self.wildcard.retain(|(sub, _)| *sub != id);
        self.listener_count() != before
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum::<usize>() + self.wildcard.len()
    }

    /// Deliver `event` to its kind's listeners, then to wildcard listeners.
    pub fn emit(&mut self, event: &NetworkEvent) {
        let kind = event.kind();
        if let Some(listeners) = self.by_kind.get_mut(&kind) {
            for (id, listener) in listeners.iter_mut() {
                invoke(*id, kind, listener, event);
            }
        }
        for (id, listener) in &mut self.wildcard {
            invoke(*id, kind, listener, event);
        }
    }

    fn allocate_id(&mut self) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        id
    }
}

fn invoke(id: SubscriptionId, kind: EventKind, listener: &mut Listener, event: &NetworkEvent) {
    let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)));
    if let Err(panic) = outcome {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        error!(subscription = id.0, ?kind, %reason, "Event listener panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn ended() -> NetworkEvent {
        NetworkEvent::MatchEnded {
            match_id: MatchId::from("m"),
            reason: EndReason::UserEnded,
        }
    }

    #[test]
    fn test_kind_routing() {
        let mut bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        bus.subscribe(EventKind::MatchEnded, move |e| sink.borrow_mut().push(e.kind()));

        bus.emit(&NetworkEvent::Disconnected { player_id: None });
        bus.emit(&ended());
        assert_eq!(*seen.borrow(), vec![EventKind::MatchEnded]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let mut bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));

        let before = Rc::clone(&count);
        bus.subscribe(EventKind::MatchEnded, move |_| *before.borrow_mut() += 1);
        bus.subscribe(EventKind::MatchEnded, |_| panic!("listener bug"));
        let after = Rc::clone(&count);
        bus.subscribe(EventKind::MatchEnded, move |_| *after.borrow_mut() += 1);
        let wildcard = Rc::clone(&count);
        bus.subscribe_all(move |_| *wildcard.borrow_mut() += 1);

        bus.emit(&ended());
        bus.emit(&ended());
        assert_eq!(*count.borrow(), 6);
    }

    #[test]
    fn test_unsubscribe() {
        let mut bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&count);
        let id = bus.subscribe_all(move |_| *sink.borrow_mut() += 1);
        assert_eq!(bus.listener_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&ended());
        assert_eq!(*count.borrow(), 0);
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(EndReason::ConnectionTimeout.as_str(), "connection_timeout");
        assert_eq!(EndReason::TickStallTimeout.to_string(), "tick_stall_timeout");
        assert_eq!(
            serde_json::to_string(&EndReason::RemoteDisconnect).unwrap(),
            "\"remote_disconnect\""
        );
    }
}
