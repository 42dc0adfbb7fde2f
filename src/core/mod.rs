//! Core primitives: hash types, fingerprints, Hamming evaluators, VP-tree.

mod fingerprint;
mod hamming;
mod hash_type;
mod point;
mod vptree;

pub use fingerprint::Fingerprint;
pub use hamming::{
    hamming_distance, hamming_reference, hamming_table, similarity, weighted_similarity,
    Evaluator, POPCOUNT_TABLE,
};
pub use hash_type::HashType;
pub use point::{DisplayMetadata, IndexedPoint};
pub use vptree::{RangeMatch, RangeStats, TreeBuilder, VantagePolicy, VpTree};
