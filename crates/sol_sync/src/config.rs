//! Sync core configuration.
//!
//! Configuration is plain data with defaults, optionally loaded from a RON
//! file so that test rigs and the headless runner can tune timeouts without
//! recompiling.
//!
//! ```ron
//! (
//!     connection_timeout_ms: 10000,
//!     stall_timeout_ms: Some(5000),
//!     hash_interval_ticks: 30,
//! )
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Ticks per second used when a match does not specify one.
pub const DEFAULT_TICK_RATE: u32 = 20;

/// Tunables for the network manager, validator and verifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long `start_match` may wait for the transport to become ready.
    pub connection_timeout_ms: u64,
    /// Optional watchdog for a tick that never completes. `None` waits forever.
    pub stall_timeout_ms: Option<u64>,
    /// Suggested cadence for `submit_state_hash`.
    pub hash_interval_ticks: u64,
    /// Number of judged ticks the verifier remembers to reject late hashes.
    pub resolved_hash_history: usize,
    /// Largest unit selection a single command may carry.
    pub max_units_per_command: usize,
    /// Largest production batch.
    pub max_batch_size: u32,
    /// Highest tick a command may target.
    pub max_tick: u64,
    /// Longest accepted player id or ability id, in bytes.
    pub max_identifier_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 30_000,
            stall_timeout_ms: None,
            hash_interval_ticks: 60,
            resolved_hash_history: 256,
            max_units_per_command: 64,
            max_batch_size: 10,
            // 24 hours at the default tick rate
            max_tick: 24 * 60 * 60 * u64::from(DEFAULT_TICK_RATE),
            max_identifier_len: 64,
        }
    }
}

impl SyncConfig {
    /// Parse a configuration from RON text. Missing fields take defaults.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    /// Load a configuration from a RON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_ron_str(&text)
    }

    /// Connection timeout as a [`Duration`].
    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Stall watchdog as a [`Duration`], if enabled.
    #[must_use]
    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.connection_timeout(), Duration::from_secs(30));
        assert!(config.stall_timeout().is_none());
        assert_eq!(config.max_tick, 1_728_000);
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let config =
            SyncConfig::from_ron_str("(connection_timeout_ms: 500, stall_timeout_ms: Some(250))")
                .unwrap();
        assert_eq!(config.connection_timeout(), Duration::from_millis(500));
        assert_eq!(config.stall_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.hash_interval_ticks, 60);
    }

    #[test]
    fn test_bad_ron_is_error() {
        assert!(SyncConfig::from_ron_str("(connection_timeout_ms: \"soon\")").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = SyncConfig::load("/definitely/not/here.ron").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
