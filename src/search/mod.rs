//! Search module - multi-hash scoring over cached VP-trees
//!
//! # Paths
//!
//! - **Indexed**: range query against the cached tree for each hash type
//! - **Linear**: bounded scan over freshly fetched candidates, used when a
//!   tree cannot be built; same answers, more work
//!
//! Both paths feed the same merge/score/rank stage in [`scorer`].

pub mod linear;
pub mod scorer;

pub use linear::{fetch_and_scan, linear_range};
pub use scorer::{MultiHashScorer, SearchResult};
