//! Hamming distance evaluators.
//!
//! Two implementations that must agree bit-for-bit:
//! - Reference: one bit at a time over the declared width
//! - Table: XOR, then a 256-entry popcount table over each byte
//!
//! `hamming_distance` is the table evaluator; the reference one exists for
//! verification and for `Evaluator::Reference` deployments.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::HashType;

/// Bit counts for every 8-bit value
pub const POPCOUNT_TABLE: [u8; 256] = build_popcount_table();

const fn build_popcount_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        // table[i] = table[i / 2] + lowest bit
        table[i] = table[i >> 1] + (i & 1) as u8;
        i += 1;
    }
    table
}

/// Compute Hamming distance between two fingerprints' bits.
#[inline]
pub fn hamming_distance(a: u128, b: u128) -> u32 {
    hamming_table(a, b)
}

/// Byte-table implementation
#[inline]
pub fn hamming_table(a: u128, b: u128) -> u32 {
    let xor = a ^ b;
    let mut total = 0u32;
    for byte in xor.to_le_bytes() {
        total += POPCOUNT_TABLE[byte as usize] as u32;
    }
    total
}

/// Reference implementation: checks each of the `bit_width` low bits
pub fn hamming_reference(a: u128, b: u128, bit_width: u32) -> u32 {
    debug_assert!(bit_width <= 128);
    let mut total = 0u32;
    for pos in 0..bit_width {
        if (a >> pos) & 1 != (b >> pos) & 1 {
            total += 1;
        }
    }
    total
}

/// Similarity from a distance: `1 - distance / bit_width`, clamped to `[0, 1]`
#[inline]
pub fn similarity(distance: u32, bit_width: u32) -> f64 {
    if bit_width == 0 {
        return 0.0;
    }
    (1.0 - distance as f64 / bit_width as f64).clamp(0.0, 1.0)
}

/// Weighted arithmetic mean of per-hash-type similarities.
///
/// Only hash types present in both maps with a positive weight take part.
/// Returns 0.0 when no such type exists.
pub fn weighted_similarity(
    per_hash_similarity: &BTreeMap<HashType, f64>,
    weights: &BTreeMap<HashType, f64>,
) -> f64 {
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;

    for (hash_type, sim) in per_hash_similarity {
        match weights.get(hash_type) {
            Some(&w) if w > 0.0 => {
                weighted_sum += w * sim;
                weight_total += w;
            }
            _ => {}
        }
    }

    if weight_total > 0.0 {
        weighted_sum / weight_total
    } else {
        0.0
    }
}

/// Evaluator selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evaluator {
    /// Bit-at-a-time
    Reference,
    /// Byte popcount table
    #[default]
    Table,
}

impl Evaluator {
    /// Distance between two same-type bit patterns of `bit_width` bits
    #[inline]
    pub fn distance(self, a: u128, b: u128, bit_width: u32) -> u32 {
        match self {
            Evaluator::Reference => hamming_reference(a, b, bit_width),
            Evaluator::Table => hamming_table(a, b),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Evaluator::Reference => "reference",
            Evaluator::Table => "table",
        }
    }

    /// Parse `reference` / `table`
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reference" | "bit" => Some(Evaluator::Reference),
            "table" | "byte" => Some(Evaluator::Table),
            _ => None,
        }
    }
}
