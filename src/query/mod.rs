//! Query API: request/response DTOs and query normalization.
//!
//! # Single query
//!
//! ```text
//! {fingerprints: {name → hex}, threshold?, limit?, weights?: {name → w}}
//!      │
//!      ▼ normalize
//! {HashType → Fingerprint}, threshold, effective limit, merged weights
//! ```
//!
//! Unknown hash type names are skipped and echoed back. Malformed hex for a
//! recognized name fails the whole query, naming the hash type.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{EngineConfig, HashWeights};
use crate::core::{Fingerprint, HashType};
use crate::search::SearchResult;
use crate::{Error, Result};

// =============================================================================
// REQUESTS
// =============================================================================

/// One similarity query
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityQuery {
    /// Hash type name (canonical or alias) → hex fingerprint
    pub fingerprints: BTreeMap<String, String>,
    /// Minimum overall similarity in `[0, 1]`; config default when absent
    pub threshold: Option<f64>,
    /// Maximum results; config default when absent, capped at `max_limit`
    pub limit: Option<usize>,
    /// Per-request weight overrides by hash type name
    pub weights: Option<BTreeMap<String, f64>>,
}

impl SimilarityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fingerprint(mut self, hash_type: impl Into<String>, hex: impl Into<String>) -> Self {
        self.fingerprints.insert(hash_type.into(), hex.into());
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_weight(mut self, hash_type: impl Into<String>, weight: f64) -> Self {
        self.weights
            .get_or_insert_with(BTreeMap::new)
            .insert(hash_type.into(), weight);
        self
    }

    /// Validate against `config` and resolve every default
    pub fn normalize(&self, config: &EngineConfig) -> Result<NormalizedQuery> {
        let threshold = self.threshold.unwrap_or(config.default_threshold);
        if !threshold.is_finite() || !(0.0..=1.0).contains(&threshold) {
            return Err(Error::InvalidParameter(format!(
                "threshold must be within [0, 1], got {threshold}"
            )));
        }

        if self.limit == Some(0) {
            return Err(Error::InvalidParameter("limit must be at least 1".into()));
        }
        let limit = config.effective_limit(self.limit);

        let mut ignored_hash_types = Vec::new();
        let mut fingerprints = BTreeMap::new();
        for (name, hex) in &self.fingerprints {
            let Some(hash_type) = HashType::parse(name) else {
                debug!(name = %name, "skipping unknown hash type");
                ignored_hash_types.push(name.clone());
                continue;
            };
            let fingerprint = Fingerprint::from_hex(hash_type, hex)?;
            if fingerprints.insert(hash_type, fingerprint).is_some() {
                return Err(Error::InvalidParameter(format!(
                    "{hash_type} given more than once"
                )));
            }
        }

        let mut overrides = BTreeMap::new();
        for (name, &weight) in self.weights.iter().flatten() {
            match HashType::parse(name) {
                Some(hash_type) => {
                    overrides.insert(hash_type, weight);
                }
                None => {
                    debug!(name = %name, "skipping weight for unknown hash type");
                    if !ignored_hash_types.contains(name) {
                        ignored_hash_types.push(name.clone());
                    }
                }
            }
        }
        let weights = config.weights.with_overrides(&overrides);
        weights.validate()?;

        Ok(NormalizedQuery {
            fingerprints,
            threshold,
            limit,
            weights,
            ignored_hash_types,
        })
    }
}

/// A query with every name parsed and every default applied
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedQuery {
    pub fingerprints: BTreeMap<HashType, Fingerprint>,
    pub threshold: f64,
    pub limit: usize,
    pub weights: HashWeights,
    pub ignored_hash_types: Vec<String>,
}

impl NormalizedQuery {
    #[inline]
    pub fn has_usable_hash_types(&self) -> bool {
        !self.fingerprints.is_empty()
    }

    /// Largest distance that can still reach `threshold` for a hash type:
    /// `floor((1 - threshold) * bit_width)`
    pub fn max_distance(&self, hash_type: HashType) -> u32 {
        let bits = hash_type.bit_width();
        let max = ((1.0 - self.threshold) * bits as f64).floor();
        (max.max(0.0) as u32).min(bits)
    }
}

/// One entry of a batch
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub id: String,
    pub fingerprints: BTreeMap<String, String>,
}

impl BatchItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fingerprints: BTreeMap::new(),
        }
    }

    pub fn with_fingerprint(mut self, hash_type: impl Into<String>, hex: impl Into<String>) -> Self {
        self.fingerprints.insert(hash_type.into(), hex.into());
        self
    }
}

/// Several queries sharing threshold, limit and weights
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchQuery {
    pub items: Vec<BatchItem>,
    pub threshold: Option<f64>,
    pub limit: Option<usize>,
    pub weights: Option<BTreeMap<String, f64>>,
}

impl BatchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(mut self, item: BatchItem) -> Self {
        self.items.push(item);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The standalone query for one item
    pub fn query_for(&self, item: &BatchItem) -> SimilarityQuery {
        SimilarityQuery {
            fingerprints: item.fingerprints.clone(),
            threshold: self.threshold,
            limit: self.limit,
            weights: self.weights.clone(),
        }
    }
}

// =============================================================================
// RESPONSES
// =============================================================================

/// Effective parameters a query ran with
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchParamsEcho {
    pub threshold: f64,
    pub limit: usize,
    /// Hash types searched
    pub hash_types: Vec<HashType>,
    /// Weight used per searched hash type
    pub weights: BTreeMap<HashType, f64>,
    /// Searched by linear scan because the index was unavailable
    pub fallback_hash_types: Vec<HashType>,
    /// Contributed nothing: index and linear scan both failed
    pub degraded_hash_types: Vec<HashType>,
    /// Names in the request that are not hash types
    pub ignored_hash_types: Vec<String>,
}

impl SearchParamsEcho {
    pub(crate) fn from_query(query: &NormalizedQuery) -> Self {
        Self {
            threshold: query.threshold,
            limit: query.limit,
            hash_types: query.fingerprints.keys().copied().collect(),
            weights: query
                .fingerprints
                .keys()
                .map(|&t| (t, query.weights.get(t)))
                .collect(),
            fallback_hash_types: Vec::new(),
            degraded_hash_types: Vec::new(),
            ignored_hash_types: query.ignored_hash_types.clone(),
        }
    }
}

/// Result of one query
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub matches: Vec<SearchResult>,
    /// Matches above threshold before truncation to `limit`
    pub total_matches: usize,
    pub params: SearchParamsEcho,
    /// Set when the query carried no recognized fingerprint
    pub no_usable_hash_types: bool,
}

impl SearchResponse {
    /// Empty response carrying the NoUsableHashTypes marker
    pub fn no_usable_hash_types(params: SearchParamsEcho) -> Self {
        Self {
            matches: Vec::new(),
            total_matches: 0,
            params,
            no_usable_hash_types: true,
        }
    }

    pub fn item_ids(&self) -> impl Iterator<Item = &str> {
        self.matches.iter().map(|m| m.item_id.as_str())
    }
}

/// Outcome of one batch entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchOutcome {
    Ok(SearchResponse),
    /// The entry was invalid; other entries are unaffected
    Rejected { error: String },
}

impl BatchOutcome {
    pub fn response(&self) -> Option<&SearchResponse> {
        match self {
            BatchOutcome::Ok(response) => Some(response),
            BatchOutcome::Rejected { .. } => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub id: String,
    pub outcome: BatchOutcome,
}

/// One result per batch entry, in request order
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<BatchResult>,
}

impl BatchResponse {
    pub fn get(&self, id: &str) -> Option<&BatchOutcome> {
        self.results.iter().find(|r| r.id == id).map(|r| &r.outcome)
    }
}
