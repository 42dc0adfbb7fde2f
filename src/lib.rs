//! # Magpie
//!
//! Perceptual-hash similarity search: find every stored image whose
//! fingerprints lie within a similarity threshold of a query, ranked by a
//! weighted fusion of per-hash-type scores.
//!
//! ## Quick Start
//! ```rust,ignore
//! use std::sync::Arc;
//! use magpie::{EngineConfig, MemorySource, SimilarityEngine, SimilarityQuery};
//!
//! // Any system of record implementing FingerprintSource
//! let source = Arc::new(MemorySource::new());
//!
//! // Composition root: one engine per process, shared by reference
//! let engine = SimilarityEngine::new(source, EngineConfig::default())?;
//!
//! // Query with one fingerprint per hash type
//! let query = SimilarityQuery::new()
//!     .with_fingerprint("perceptual_hash", "f0e1d2c3b4a59687")
//!     .with_fingerprint("dhash", "0123456789abcdef")
//!     .with_threshold(0.9);
//! let response = engine.search(&query).await?;
//!
//! // Cache control
//! engine.invalidate(Some(magpie::HashType::Perceptual));
//! let stats = engine.stats();
//! ```
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            MAGPIE                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │   Query    → normalize hex → one Fingerprint per HashType       │
//! │   Scorer   → per-type range query → merge → score → rank        │
//! │   Cache    → one VP-tree per HashType, TTL + single-flight      │
//! │   VP-tree  → exact Hamming range queries (no false negatives)   │
//! │   Hamming  → reference (bit) / table (byte popcount) evaluators │
//! │   Fallback → bounded linear scan when an index build fails      │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

// === Core modules ===
pub mod config;
pub mod core;
pub mod engine;
pub mod query;
pub mod search;
pub mod storage;

// === Re-exports for convenience ===

// Core types
pub use crate::core::{
    hamming_distance, similarity, weighted_similarity, DisplayMetadata, Evaluator, Fingerprint,
    HashType, IndexedPoint, RangeMatch, TreeBuilder, VantagePolicy, VpTree,
};

// Configuration
pub use crate::config::{EngineConfig, HashWeights};

// Data source + cache
pub use crate::storage::{
    CacheEntry, CacheMetrics, CacheStat, FingerprintSource, IndexBuildError, IndexCache,
    MemorySource, MetricsSnapshot,
};

// Query API
pub use crate::query::{
    BatchItem, BatchOutcome, BatchQuery, BatchResponse, BatchResult, NormalizedQuery,
    SearchParamsEcho, SearchResponse, SimilarityQuery,
};

// Scoring
pub use crate::search::{MultiHashScorer, SearchResult};

// Composition root
pub use crate::engine::SimilarityEngine;

// === Error types ===

/// Crate-level error type
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid {hash_type} fingerprint: {reason}")]
    Format { hash_type: String, reason: String },

    #[error("Unknown hash type: {0}")]
    UnknownHashType(String),

    #[error("Hash type mismatch: expected {expected}, got {got}")]
    HashTypeMismatch { expected: HashType, got: HashType },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Data source error: {0}")]
    Source(String),

    #[error("Index build error: {0}")]
    IndexBuild(#[from] storage::IndexBuildError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// FormatError for a hash type
    pub(crate) fn format(hash_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Format {
            hash_type: hash_type.into(),
            reason: reason.into(),
        }
    }

    /// True for errors caused by the caller's input (client errors)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Format { .. } | Error::UnknownHashType(_) | Error::InvalidParameter(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// === Constants ===

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
