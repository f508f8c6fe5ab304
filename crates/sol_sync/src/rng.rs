//! Deterministic seeded random number generator.
//!
//! Every peer builds its own [`SeededRng`] from the match seed and routes all
//! gameplay randomness (asteroid placement, spawn jitter, AI decisions)
//! through it. Two generators with the same seed and the same call sequence
//! produce bit-identical output on every platform:
//!
//! - The core is SplitMix64, pure 64-bit integer arithmetic.
//! - Floats are built from the top 53 bits and a power-of-two scale, which is
//!   exact in IEEE-754 and needs no platform math library.
//!
//! There is no process-wide "current RNG". Simulation code owns its
//! generator and threads it explicitly.

use std::f64::consts::TAU;

use serde::{Deserialize, Serialize};

use crate::math::Fixed;

const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// 2^-53, the spacing of doubles in `[0.5, 1)`.
const UNIT_SCALE: f64 = 1.0 / (1u64 << 53) as f64;

/// Seeded SplitMix64 generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeededRng {
    seed: u64,
    state: u64,
}

impl SeededRng {
    /// Create a generator from a match seed.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self { seed, state: seed }
    }

    /// The seed this generator was created with.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Current internal state, for desync diagnostics and state hashing.
    #[must_use]
    pub const fn state(&self) -> u64 {
        self.state
    }

    /// Next raw 64-bit value.
    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(GOLDEN_GAMMA);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform value in `[0, 1)`.
    pub fn next(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * UNIT_SCALE
    }

    /// Uniform integer in `[lo, hi]`, both ends inclusive.
    ///
    /// Reversed bounds are swapped rather than rejected.
    pub fn next_int(&mut self, lo: i64, hi: i64) -> i64 {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        let span = (i128::from(hi) - i128::from(lo) + 1) as u128;
        // Multiply-shift maps 64 random bits onto the span without a modulo loop
        let offset = (u128::from(self.next_u64()) * span) >> 64;
        (i128::from(lo) + offset as i128) as i64
    }

    /// Uniform float in `[lo, hi)`.
    pub fn next_float(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next()
    }

    /// Uniform angle in radians, `[0, 2π)`.
    pub fn next_angle(&mut self) -> f64 {
        self.next() * TAU
    }

    /// Uniform fixed-point value in `[lo, hi)`; use this in simulation code.
    pub fn next_fixed(&mut self, lo: Fixed, hi: Fixed) -> Fixed {
        let fraction = Fixed::from_bits((self.next_u64() >> 32) as i64);
        lo.saturating_add(hi.saturating_sub(lo).saturating_mul(fraction))
    }

    /// True with probability `percent / 100`.
    pub fn chance(&mut self, percent: u8) -> bool {
        self.next_int(0, 99) < i64::from(percent)
    }
}

/// Generate a fresh match seed from OS randomness.
///
/// Only the match creator calls this; every peer then derives its
/// [`SeededRng`] from the stored seed.
#[must_use]
pub fn generate_seed() -> u64 {
    u64::from(rand::random::<u32>())
}
