//! Multi-hash scorer.
//!
//! ```text
//! NORMALIZE → PER-TYPE SEARCH → MERGE by item → SCORE → FILTER → RANK → TRUNCATE
//!                 │
//!                 ├── index:  cache.get_or_build(t) → tree.range(q, max_distance)
//!                 └── on failure: linear scan over freshly fetched candidates
//! ```
//!
//! Per-type searches run concurrently; they only read immutable trees.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::linear;
use crate::config::EngineConfig;
use crate::core::{similarity, weighted_similarity, DisplayMetadata, Evaluator, Fingerprint, HashType};
use crate::query::{NormalizedQuery, SearchParamsEcho, SearchResponse};
use crate::storage::IndexCache;

/// Slack for rounding in the weighted mean when comparing against the threshold
const SCORE_EPSILON: f64 = 1e-9;

/// One ranked hit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub item_id: String,
    pub per_hash_distance: BTreeMap<HashType, u32>,
    pub per_hash_similarity: BTreeMap<HashType, f64>,
    pub overall_similarity: f64,
    pub metadata: Arc<DisplayMetadata>,
}

/// How one hash type was searched
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SearchPath {
    Indexed,
    Fallback,
    Degraded,
}

struct Hit {
    item_id: String,
    distance: u32,
    metadata: Arc<DisplayMetadata>,
}

struct TypeOutcome {
    hash_type: HashType,
    path: SearchPath,
    hits: Vec<Hit>,
}

/// Drives per-type searches and fuses their scores
#[derive(Clone)]
pub struct MultiHashScorer {
    cache: IndexCache,
    evaluator: Evaluator,
    max_linear_candidates: usize,
    fetch_timeout: Duration,
}

impl MultiHashScorer {
    pub fn new(cache: IndexCache, config: &EngineConfig) -> Self {
        Self {
            cache,
            evaluator: config.evaluator,
            max_linear_candidates: config.max_linear_candidates,
            fetch_timeout: config.fetch_timeout,
        }
    }

    pub fn cache(&self) -> &IndexCache {
        &self.cache
    }

    /// Run the full pipeline for one normalized query
    pub async fn search(&self, query: &NormalizedQuery) -> SearchResponse {
        let mut params = SearchParamsEcho::from_query(query);
        if !query.has_usable_hash_types() {
            debug!(ignored = ?query.ignored_hash_types, "query has no usable hash types");
            return SearchResponse::no_usable_hash_types(params);
        }

        let searches = query
            .fingerprints
            .values()
            .map(|fp| self.search_type(fp, query.max_distance(fp.hash_type())));
        let outcomes = futures::future::join_all(searches).await;

        for outcome in &outcomes {
            match outcome.path {
                SearchPath::Indexed => {}
                SearchPath::Fallback => params.fallback_hash_types.push(outcome.hash_type),
                SearchPath::Degraded => params.degraded_hash_types.push(outcome.hash_type),
            }
        }

        let mut matches = merge(outcomes, query);
        let total_matches = matches.len();
        matches.truncate(query.limit);

        SearchResponse {
            matches,
            total_matches,
            params,
            no_usable_hash_types: false,
        }
    }

    async fn search_type(&self, query: &Fingerprint, max_distance: u32) -> TypeOutcome {
        let hash_type = query.hash_type();

        let indexed = match self.cache.get_or_build(hash_type).await {
            Ok(entry) => entry
                .tree
                .range_with_stats(query, max_distance)
                .map(|(matches, stats)| {
                    debug!(
                        %hash_type,
                        max_distance,
                        visited = stats.visited,
                        matched = stats.matched,
                        size = entry.tree.len(),
                        "range query"
                    );
                    matches
                        .into_iter()
                        .map(|m| Hit {
                            item_id: m.point.item_id.clone(),
                            distance: m.distance,
                            metadata: m.point.metadata.clone(),
                        })
                        .collect::<Vec<_>>()
                })
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        let reason = match indexed {
            Ok(hits) => {
                return TypeOutcome { hash_type, path: SearchPath::Indexed, hits };
            }
            Err(reason) => reason,
        };

        warn!(%hash_type, error = %reason, "index unavailable, falling back to linear scan");
        self.cache.metrics().record_fallback();

        match linear::fetch_and_scan(
            self.cache.source().as_ref(),
            query,
            max_distance,
            self.evaluator,
            self.max_linear_candidates,
            self.fetch_timeout,
        )
        .await
        {
            Ok(found) => TypeOutcome {
                hash_type,
                path: SearchPath::Fallback,
                hits: found
                    .into_iter()
                    .map(|(point, distance)| Hit {
                        item_id: point.item_id,
                        distance,
                        metadata: point.metadata,
                    })
                    .collect(),
            },
            Err(e) => {
                error!(%hash_type, error = %e, "linear scan failed, hash type contributes nothing");
                TypeOutcome { hash_type, path: SearchPath::Degraded, hits: Vec::new() }
            }
        }
    }
}

/// Merge per-type hits by item, score, filter and rank
fn merge(outcomes: Vec<TypeOutcome>, query: &NormalizedQuery) -> Vec<SearchResult> {
    let mut by_item: BTreeMap<String, SearchResult> = BTreeMap::new();

    for outcome in outcomes {
        let bit_width = outcome.hash_type.bit_width();
        for hit in outcome.hits {
            let result = by_item.entry(hit.item_id).or_insert_with_key(|id| SearchResult {
                item_id: id.clone(),
                per_hash_distance: BTreeMap::new(),
                per_hash_similarity: BTreeMap::new(),
                overall_similarity: 0.0,
                metadata: hit.metadata.clone(),
            });
            // An item may hold several fingerprints of one type; the closest counts
            let distance = *result
                .per_hash_distance
                .entry(outcome.hash_type)
                .and_modify(|d| *d = (*d).min(hit.distance))
                .or_insert(hit.distance);
            result
                .per_hash_similarity
                .insert(outcome.hash_type, similarity(distance, bit_width));
        }
    }

    let weights = query.weights.as_map();
    let mut results: Vec<SearchResult> = by_item
        .into_values()
        .filter_map(|mut r| {
            r.overall_similarity = weighted_similarity(&r.per_hash_similarity, weights);
            (r.overall_similarity + SCORE_EPSILON >= query.threshold).then_some(r)
        })
        .collect();

    results.sort_by(rank);
    results
}

/// Descending overall similarity, then ascending item id
fn rank(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.overall_similarity
        .total_cmp(&a.overall_similarity)
        .then_with(|| a.item_id.cmp(&b.item_id))
}
