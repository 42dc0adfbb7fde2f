//! Fixed-width perceptual hash fingerprint and its hex codec.

use std::fmt;
use std::hash::{Hash, Hasher};

use super::hamming;
use super::HashType;
use crate::{Error, Result};

/// 64- or 128-bit fingerprint tagged with its hash type.
///
/// Stored in a `u128`; bits above the type's width are always zero, so
/// distances never see stray high bits.
#[derive(Clone, Copy)]
pub struct Fingerprint {
    bits: u128,
    hash_type: HashType,
}

impl Fingerprint {
    /// Create from raw bits, rejecting values wider than the hash type
    pub fn from_raw(hash_type: HashType, bits: u128) -> Result<Self> {
        if bits & !hash_type.mask() != 0 {
            return Err(Error::format(
                hash_type.name(),
                format!("value exceeds {} bits", hash_type.bit_width()),
            ));
        }
        Ok(Self { bits, hash_type })
    }

    /// Create from a 64-bit value (any hash type is at least 64 bits wide)
    #[inline]
    pub fn from_u64(hash_type: HashType, bits: u64) -> Self {
        Self { bits: bits as u128, hash_type }
    }

    /// Decode the hex external form.
    ///
    /// Accepts an optional `0x`/`0X` prefix, then requires exactly
    /// `bit_width / 4` hex digits of either case.
    pub fn from_hex(hash_type: HashType, hex: &str) -> Result<Self> {
        let digits = hex
            .strip_prefix("0x")
            .or_else(|| hex.strip_prefix("0X"))
            .unwrap_or(hex);

        let expected = hash_type.hex_len();
        if digits.len() != expected {
            return Err(Error::format(
                hash_type.name(),
                format!("expected {} hex digits, got {}", expected, digits.len()),
            ));
        }
        if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(Error::format(
                hash_type.name(),
                format!("invalid hex digit {:?}", bad),
            ));
        }

        let bits = u128::from_str_radix(digits, 16)
            .map_err(|e| Error::format(hash_type.name(), e.to_string()))?;
        Ok(Self { bits, hash_type })
    }

    /// Encode as zero-padded lower-case hex of exactly `bit_width / 4` digits
    pub fn to_hex(&self) -> String {
        format!("{:0width$x}", self.bits, width = self.hash_type.hex_len())
    }

    /// Create zero fingerprint
    pub fn zero(hash_type: HashType) -> Self {
        Self { bits: 0, hash_type }
    }

    /// Create all-ones fingerprint
    pub fn ones(hash_type: HashType) -> Self {
        Self { bits: hash_type.mask(), hash_type }
    }

    /// Get raw bits
    #[inline]
    pub fn bits(&self) -> u128 {
        self.bits
    }

    /// Hash type tag
    #[inline]
    pub fn hash_type(&self) -> HashType {
        self.hash_type
    }

    /// Width in bits
    #[inline]
    pub fn bit_width(&self) -> u32 {
        self.hash_type.bit_width()
    }

    /// Hamming distance to another fingerprint of the same hash type
    #[inline]
    pub fn hamming(&self, other: &Fingerprint) -> u32 {
        debug_assert_eq!(self.hash_type, other.hash_type);
        hamming::hamming_distance(self.bits, other.bits)
    }

    /// Similarity (0.0 - 1.0)
    #[inline]
    pub fn similarity(&self, other: &Fingerprint) -> f64 {
        hamming::similarity(self.hamming(other), self.bit_width())
    }

    /// Hamming distance, failing on mismatched hash types
    pub fn try_hamming(&self, other: &Fingerprint) -> Result<u32> {
        if self.hash_type != other.hash_type {
            return Err(Error::HashTypeMismatch {
                expected: self.hash_type,
                got: other.hash_type,
            });
        }
        Ok(self.hamming(other))
    }
}

impl PartialEq for Fingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.hash_type == other.hash_type && self.bits == other.bits
    }
}

impl Eq for Fingerprint {}

impl Hash for Fingerprint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_type.hash(state);
        self.bits.hash(state);
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}:{})", self.hash_type, self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
