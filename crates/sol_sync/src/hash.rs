//! Platform-stable state hashing.
//!
//! `std`'s `DefaultHasher` is not guaranteed to be stable across Rust
//! releases, so peers built by different toolchains could disagree on the
//! hash of identical state. [`StateHasher`] is FNV-1a over explicit
//! little-endian encodings instead.

use crate::math::{Fixed, Vec2Fixed};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Incremental FNV-1a hasher for simulation summaries.
#[derive(Debug, Clone)]
pub struct StateHasher {
    hash: u64,
}

impl Default for StateHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl StateHasher {
    /// Start a new hash.
    #[must_use]
    pub const fn new() -> Self {
        Self { hash: FNV_OFFSET }
    }

    /// Feed raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        for &byte in bytes {
            self.hash ^= u64::from(byte);
            self.hash = self.hash.wrapping_mul(FNV_PRIME);
        }
        self
    }

    /// Feed a `u64`.
    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Feed an `i64`.
    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Feed a `u32`.
    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Feed a string, length-prefixed so adjacent strings cannot alias.
    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write_u64(value.len() as u64).write_bytes(value.as_bytes())
    }

    /// Feed a fixed-point value by its raw bits.
    pub fn write_fixed(&mut self, value: Fixed) -> &mut Self {
        self.write_i64(value.to_bits())
    }

    /// Feed a fixed-point vector.
    pub fn write_vec2(&mut self, value: Vec2Fixed) -> &mut Self {
        self.write_fixed(value.x).write_fixed(value.y)
    }

    /// Final hash value.
    #[must_use]
    pub const fn finish(&self) -> u64 {
        self.hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv_reference_vectors() {
        assert_eq!(StateHasher::new().finish(), 0xcbf2_9ce4_8422_2325);
        assert_eq!(
            StateHasher::new().write_bytes(b"a").finish(),
            0xaf63_dc4c_8601_ec8c
        );
        assert_eq!(
            StateHasher::new().write_bytes(b"foobar").finish(),
            0x8594_4171_f739_67e8
        );
    }

    #[test]
    fn test_strings_do_not_alias() {
        let ab_c = StateHasher::new().write_str("ab").write_str("c").finish();
        let a_bc = StateHasher::new().write_str("a").write_str("bc").finish();
        assert_ne!(ab_c, a_bc);
    }

    #[test]
    fn test_order_matters() {
        let a = StateHasher::new().write_u64(1).write_u64(2).finish();
        let b = StateHasher::new().write_u64(2).write_u64(1).finish();
        assert_ne!(a, b);
    }
}
