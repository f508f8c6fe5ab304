//! # SoL Sync
//!
//! Deterministic lockstep synchronization core for SoL multiplayer.
//!
//! Every peer runs the same simulation. This crate only makes sure each of
//! them applies the same commands, in the same order, at the same tick:
//! - Local input is validated, stamped with a tick and broadcast
//! - A tick resolves only once every player has closed it
//! - Periodic state hashes detect divergence after the fact
//!
//! No rollback, no authoritative server, no prediction.
//!
//! ## Crate Structure
//!
//! - [`command`] - Commands, player and match ids
//! - [`wire`] - JSON wire codec
//! - [`validator`] - Pure command validation
//! - [`queue`] - Per-player buffers and the tick barrier
//! - [`transport`] - Transport trait and the in-process loopback
//! - [`verifier`] - State hash exchange and desync detection
//! - [`events`] - Typed event bus
//! - [`store`] - Match persistence seam and in-memory store
//! - [`manager`] - Match lifecycle and the per-tick API
//! - [`replay`] - Match recordings
//! - [`rng`] - Seeded deterministic RNG
//! - [`math`] / [`hash`] - Fixed-point math and state hashing

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod command;
pub mod config;
pub mod error;
pub mod events;
pub mod hash;
pub mod manager;
pub mod math;
pub mod queue;
pub mod replay;
pub mod rng;
pub mod store;
pub mod transport;
pub mod validator;
pub mod verifier;
pub mod wire;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::command::{
        Command, GameCommand, MatchId, PlayerId, StructureKind, TickCommands, UnitKind,
        STATE_HASH_COMMAND,
    };
    pub use crate::config::SyncConfig;
    pub use crate::error::{Result, SyncError, ValidationError};
    pub use crate::events::{EndReason, ErrorCause, EventBus, EventKind, NetworkEvent};
    pub use crate::hash::StateHasher;
    pub use crate::manager::{MatchPhase, NetworkManager, NetworkStats};
    pub use crate::math::{Fixed, Vec2Fixed};
    pub use crate::queue::CommandQueue;
    pub use crate::replay::MatchRecording;
    pub use crate::rng::{generate_seed, SeededRng};
    pub use crate::store::{
        CreateMatchOptions, GameSettings, Match, MatchPlayer, MatchStatus, MatchStore,
        MemoryMatchStore,
    };
    pub use crate::transport::{
        LoopbackNetwork, LoopbackTransport, Transport, TransportContext, TransportFactory,
    };
    pub use crate::validator::{CommandValidator, ValidationRules};
    pub use crate::verifier::{DesyncReport, StateVerifier};
}
