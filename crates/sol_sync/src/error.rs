//! Error types for the sync core.

use thiserror::Error;

use crate::command::PlayerId;
use crate::manager::MatchPhase;

/// Result type alias using [`SyncError`].
pub type Result<T> = std::result::Result<T, SyncError>;

/// Top-level error type for the sync core.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A command failed validation.
    #[error("Invalid command: {0}")]
    InvalidCommand(#[from] ValidationError),

    /// A command could not be encoded or decoded.
    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    /// The persistence collaborator failed.
    #[error("Match store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The transport rejected an operation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An operation was attempted in the wrong lifecycle phase.
    #[error("Operation '{operation}' not allowed in phase {phase:?}")]
    InvalidPhase {
        /// Operation that was attempted.
        operation: &'static str,
        /// Phase the manager was in.
        phase: MatchPhase,
    },

    /// Match recording could not be read or written.
    #[error("Recording error: {0}")]
    Recording(String),
}

/// Reasons a command is rejected by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Player id was empty.
    #[error("player id is empty")]
    EmptyPlayerId,

    /// Player id exceeded the configured length.
    #[error("player id is {len} bytes, limit is {max}")]
    PlayerIdTooLong {
        /// Actual length.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// Author is not part of the match roster.
    #[error("player '{0}' is not in the match roster")]
    UnknownPlayer(PlayerId),

    /// Tick is beyond the longest allowed match.
    #[error("tick {tick} exceeds limit {max}")]
    TickOutOfRange {
        /// Command tick.
        tick: u64,
        /// Configured limit.
        max: u64,
    },

    /// Command type is reserved for internal traffic.
    #[error("command type '{0}' is reserved")]
    ReservedCommandType(&'static str),

    /// Unit list was empty.
    #[error("command targets no units")]
    NoUnits,

    /// Unit list exceeded the configured size.
    #[error("command targets {count} units, limit is {max}")]
    TooManyUnits {
        /// Number of units.
        count: usize,
        /// Configured limit.
        max: usize,
    },

    /// Unit list contained the same id twice.
    #[error("unit {0} listed more than once")]
    DuplicateUnit(u32),

    /// A unit attempted to attack itself.
    #[error("unit {0} cannot target itself")]
    SelfTarget(u32),

    /// A position fell outside the map.
    #[error("position ({x}, {y}) is outside the map")]
    OutOfBounds {
        /// X coordinate.
        x: String,
        /// Y coordinate.
        y: String,
    },

    /// Ability identifier was malformed.
    #[error("ability id '{0}' is malformed")]
    BadAbilityId(String),

    /// Production batch size was out of range.
    #[error("batch size {count} must be between 1 and {max}")]
    BadBatchSize {
        /// Requested count.
        count: u32,
        /// Configured limit.
        max: u32,
    },
}

/// Errors from the wire codec.
#[derive(Debug, Error)]
pub enum WireError {
    /// JSON encoding or decoding failed (missing fields, unknown command type, ...).
    #[error("malformed command message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors reported by a [`MatchStore`](crate::store::MatchStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The referenced match does not exist.
    #[error("match '{0}' not found")]
    MatchNotFound(String),

    /// The referenced player does not exist in the match.
    #[error("player '{player}' not found in match '{match_id}'")]
    PlayerNotFound {
        /// Match id.
        match_id: String,
        /// Player id.
        player: String,
    },

    /// Backend failure.
    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Errors while loading a [`SyncConfig`](crate::config::SyncConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the file failed.
    #[error("failed to read '{path}': {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// RON parsing failed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),
}
