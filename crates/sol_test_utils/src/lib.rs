//! # SoL Test Utilities
//!
//! Shared testing utilities for the sync core and the headless runner:
//! - Reference arena simulation driven by tick commands
//! - Determinism test harness
//! - Multi-peer lockstep rig over the loopback transport
//! - Fixtures and property-based testing strategies

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod arena;
pub mod determinism;
pub mod fixtures;
pub mod lockstep;

/// Re-export proptest for convenience.
pub use proptest;
