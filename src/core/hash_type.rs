//! Hash type registry.
//!
//! Every fingerprint carries a `HashType` tag. The tag fixes the bit width
//! (and therefore the hex length) and names the weight used during fusion.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Perceptual hash families understood by the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HashType {
    #[serde(rename = "perceptual_hash")]
    Perceptual,
    #[serde(rename = "average_hash")]
    Average,
    #[serde(rename = "difference_hash")]
    Difference,
    #[serde(rename = "wavelet_hash")]
    Wavelet,
    #[serde(rename = "color_hash")]
    Color,
    #[serde(rename = "block_hash_8")]
    Block8,
    #[serde(rename = "block_hash_16")]
    Block16,
}

impl HashType {
    /// All hash types, in canonical order
    pub const ALL: [HashType; 7] = [
        HashType::Perceptual,
        HashType::Average,
        HashType::Difference,
        HashType::Wavelet,
        HashType::Color,
        HashType::Block8,
        HashType::Block16,
    ];

    /// Canonical snake_case name (wire and config form)
    pub const fn name(self) -> &'static str {
        match self {
            HashType::Perceptual => "perceptual_hash",
            HashType::Average => "average_hash",
            HashType::Difference => "difference_hash",
            HashType::Wavelet => "wavelet_hash",
            HashType::Color => "color_hash",
            HashType::Block8 => "block_hash_8",
            HashType::Block16 => "block_hash_16",
        }
    }

    /// Width of the fingerprint in bits
    #[inline]
    pub const fn bit_width(self) -> u32 {
        match self {
            HashType::Block16 => 128,
            _ => 64,
        }
    }

    /// Number of hex digits in the external form
    #[inline]
    pub const fn hex_len(self) -> usize {
        (self.bit_width() / 4) as usize
    }

    /// Mask selecting the valid bits of a fingerprint of this type
    #[inline]
    pub const fn mask(self) -> u128 {
        if self.bit_width() == 128 {
            u128::MAX
        } else {
            (1u128 << self.bit_width()) - 1
        }
    }

    /// Default fusion weight. Perceptual is the strongest signal,
    /// color the coarsest.
    pub const fn default_weight(self) -> f64 {
        match self {
            HashType::Perceptual => 1.0,
            HashType::Average => 0.8,
            HashType::Block16 => 0.7,
            HashType::Difference => 0.6,
            HashType::Wavelet => 0.5,
            HashType::Block8 => 0.4,
            HashType::Color => 0.3,
        }
    }

    /// Parse a name, accepting canonical names and short aliases
    /// (`phash`, `dhash`, `blockhash16`, ...). Case-insensitive.
    pub fn parse(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        let ty = match lower.as_str() {
            "perceptual_hash" | "perceptual" | "phash" => HashType::Perceptual,
            "average_hash" | "average" | "ahash" => HashType::Average,
            "difference_hash" | "difference" | "dhash" => HashType::Difference,
            "wavelet_hash" | "wavelet" | "whash" => HashType::Wavelet,
            "color_hash" | "color" | "colorhash" => HashType::Color,
            "block_hash_8" | "block8" | "blockhash8" => HashType::Block8,
            "block_hash_16" | "block16" | "blockhash16" => HashType::Block16,
            _ => return None,
        };
        Some(ty)
    }

    /// Environment-variable suffix (`PERCEPTUAL_HASH`, `BLOCK_HASH_16`, ...)
    pub fn env_suffix(self) -> String {
        self.name().to_ascii_uppercase()
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        HashType::parse(s).ok_or_else(|| Error::UnknownHashType(s.to_string()))
    }
}
