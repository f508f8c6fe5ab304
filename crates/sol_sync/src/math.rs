//! Fixed-point math for command payloads and deterministic simulation.
//!
//! Positions carried in commands are fixed-point so that every peer feeds
//! bit-identical values into its simulation. Floating-point operations can
//! produce different results on different CPUs.

use fixed::types::I32F32;
use serde::{Deserialize, Serialize};

/// Fixed-point number type for all simulation math.
///
/// 32 integer bits, 32 fractional bits.
pub type Fixed = I32F32;

/// Fixed-point 2D vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Vec2Fixed {
    /// X coordinate.
    #[serde(with = "fixed_serde")]
    pub x: Fixed,
    /// Y coordinate.
    #[serde(with = "fixed_serde")]
    pub y: Fixed,
}

/// Serde support for fixed-point numbers.
///
/// Serializes as the raw bit representation (i64) so values survive the
/// wire without rounding.
pub mod fixed_serde {
    use super::Fixed;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a fixed-point number as its raw bits.
    pub fn serialize<S>(value: &Fixed, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.to_bits().serialize(serializer)
    }

    /// Deserialize a fixed-point number from its raw bits.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Fixed, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bits = i64::deserialize(deserializer)?;
        Ok(Fixed::from_bits(bits))
    }
}

impl Vec2Fixed {
    /// Zero vector.
    pub const ZERO: Self = Self {
        x: Fixed::ZERO,
        y: Fixed::ZERO,
    };

    /// Create a new fixed-point vector.
    #[must_use]
    pub const fn new(x: Fixed, y: Fixed) -> Self {
        Self { x, y }
    }

    /// Create a vector from whole-number coordinates.
    #[must_use]
    pub fn from_ints(x: i32, y: i32) -> Self {
        Self::new(Fixed::from_num(x), Fixed::from_num(y))
    }

    /// Squared distance (avoids sqrt for comparisons).
    #[must_use]
    pub fn distance_squared(self, other: Self) -> Fixed {
        let dx = self.x.saturating_sub(other.x);
        let dy = self.y.saturating_sub(other.y);
        dx.saturating_mul(dx).saturating_add(dy.saturating_mul(dy))
    }

    /// Dot product.
    #[must_use]
    pub fn dot(self, other: Self) -> Fixed {
        self.x
            .saturating_mul(other.x)
            .saturating_add(self.y.saturating_mul(other.y))
    }

    /// True when both coordinates lie within `[-extent, extent]`.
    #[must_use]
    pub fn within_extent(self, extent: Fixed) -> bool {
        self.x >= -extent && self.x <= extent && self.y >= -extent && self.y <= extent
    }

    /// Normalize using fixed-point math. The zero vector stays zero.
    #[must_use]
    pub fn normalize(self) -> Self {
        let len = self.length();
        if len == Fixed::ZERO {
            return Self::ZERO;
        }
        Self::new(self.x / len, self.y / len)
    }

    /// Euclidean length.
    #[must_use]
    pub fn length(self) -> Fixed {
        fixed_sqrt(self.dot(self))
    }

    /// Move towards `target` by at most `max_step`, snapping when close enough.
    #[must_use]
    pub fn step_towards(self, target: Self, max_step: Fixed) -> Self {
        let delta = target - self;
        if delta.distance_squared(Self::ZERO) <= max_step.saturating_mul(max_step) {
            return target;
        }
        let dir = delta.normalize();
        Self::new(
            self.x.saturating_add(dir.x.saturating_mul(max_step)),
            self.y.saturating_add(dir.y.saturating_mul(max_step)),
        )
    }
}

/// Square root of a fixed-point number by binary search.
fn fixed_sqrt(value: Fixed) -> Fixed {
    if value <= Fixed::ZERO {
        return Fixed::ZERO;
    }

    let mut low = Fixed::ZERO;
    let mut high = if value > Fixed::ONE { value } else { Fixed::ONE };

    for _ in 0..48 {
        let mid = low + (high - low) / 2;
        if mid.saturating_mul(mid) <= value {
            low = mid;
        } else {
            high = mid;
        }
    }

    low
}

impl std::ops::Add for Vec2Fixed {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self::new(self.x.saturating_add(rhs.x), self.y.saturating_add(rhs.y))
    }
}

impl std::ops::Sub for Vec2Fixed {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self::new(self.x.saturating_sub(rhs.x), self.y.saturating_sub(rhs.y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec2_distance_squared() {
        let a = Vec2Fixed::from_ints(3, 0);
        let b = Vec2Fixed::from_ints(0, 4);
        assert_eq!(a.distance_squared(b), Fixed::from_num(25));
    }

    #[test]
    fn test_within_extent() {
        let extent = Fixed::from_num(100);
        assert!(Vec2Fixed::from_ints(100, -100).within_extent(extent));
        assert!(!Vec2Fixed::from_ints(101, 0).within_extent(extent));
        assert!(!Vec2Fixed::from_ints(0, -101).within_extent(extent));
    }

    #[test]
    fn test_step_towards_snaps_when_close() {
        let from = Vec2Fixed::from_ints(0, 0);
        let to = Vec2Fixed::from_ints(1, 1);
        assert_eq!(from.step_towards(to, Fixed::from_num(5)), to);
    }

    #[test]
    fn test_step_towards_moves_by_step() {
        let from = Vec2Fixed::from_ints(0, 0);
        let to = Vec2Fixed::from_ints(30, 40);
        let next = from.step_towards(to, Fixed::from_num(5));

        // 3-4-5 triangle: one step lands near (3, 4)
        let epsilon = Fixed::ONE / Fixed::from_num(1000);
        assert!((next.x - Fixed::from_num(3)).abs() < epsilon);
        assert!((next.y - Fixed::from_num(4)).abs() < epsilon);
    }

    #[test]
    fn test_fixed_serde_keeps_bits() {
        let v = Vec2Fixed::new(Fixed::ONE / Fixed::from_num(3), Fixed::from_num(-7));
        let json = serde_json::to_string(&v).unwrap();
        let back: Vec2Fixed = serde_json::from_str(&json).unwrap();
        assert_eq!(v, back);
    }
}
