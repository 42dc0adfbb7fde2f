//! Composition root: one `SimilarityEngine` per process.
//!
//! Owns the index cache and the scorer, wires the data source into both, and
//! exposes the query, batch and cache-control surface.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::core::HashType;
use crate::query::{
    BatchItem, BatchOutcome, BatchQuery, BatchResponse, BatchResult, SearchResponse,
    SimilarityQuery,
};
use crate::search::MultiHashScorer;
use crate::storage::{CacheStat, FingerprintSource, IndexCache, MetricsSnapshot};
use crate::Result;

/// Similarity search over one data source
#[derive(Clone)]
pub struct SimilarityEngine {
    config: Arc<EngineConfig>,
    scorer: MultiHashScorer,
}

impl SimilarityEngine {
    /// Validate `config` and wire the cache and scorer onto `source`
    pub fn new(source: Arc<dyn FingerprintSource>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let cache = IndexCache::new(source, &config);
        let scorer = MultiHashScorer::new(cache, &config);
        info!(
            ttl_secs = config.cache_ttl.as_secs_f64(),
            policy = ?config.vantage_policy,
            evaluator = config.evaluator.name(),
            "similarity engine ready"
        );
        Ok(Self {
            config: Arc::new(config),
            scorer,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn cache(&self) -> &IndexCache {
        self.scorer.cache()
    }

    // ========== Queries ==========

    /// Run one query.
    ///
    /// Only invalid input fails; index trouble degrades to a linear scan.
    pub async fn search(&self, query: &SimilarityQuery) -> Result<SearchResponse> {
        let normalized = query.normalize(&self.config)?;
        let started = Instant::now();
        let response = self.scorer.search(&normalized).await;
        debug!(
            hash_types = ?response.params.hash_types,
            threshold = normalized.threshold,
            total = response.total_matches,
            returned = response.matches.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "search complete"
        );
        Ok(response)
    }

    /// Run every batch entry independently and concurrently.
    ///
    /// Invalid shared options fail the whole batch. A bad entry is
    /// rejected on its own.
    pub async fn search_batch(&self, batch: &BatchQuery) -> Result<BatchResponse> {
        // Shared options are checked once, up front
        batch.query_for(&BatchItem::default()).normalize(&self.config)?;

        let runs = batch.items.iter().map(|item| async move {
            let outcome = match self.search(&batch.query_for(item)).await {
                Ok(response) => BatchOutcome::Ok(response),
                Err(e) => {
                    debug!(id = %item.id, error = %e, "batch entry rejected");
                    BatchOutcome::Rejected { error: e.to_string() }
                }
            };
            BatchResult {
                id: item.id.clone(),
                outcome,
            }
        });

        Ok(BatchResponse {
            results: futures::future::join_all(runs).await,
        })
    }

    // ========== Cache control ==========

    /// Drop cached indexes for one hash type, or all when `None`
    pub fn invalidate(&self, hash_type: Option<HashType>) {
        info!(hash_type = ?hash_type, "invalidating index cache");
        self.cache().invalidate(hash_type);
    }

    /// Build indexes ahead of the first query; returns point counts per type.
    ///
    /// Every type is attempted. The first failure (in hash type order) is
    /// returned as `Error::IndexBuild`.
    pub async fn warm_up(&self, hash_types: &[HashType]) -> Result<BTreeMap<HashType, usize>> {
        let mut built = BTreeMap::new();
        for (hash_type, result) in self.cache().warm_up(hash_types).await {
            built.insert(hash_type, result?);
        }
        Ok(built)
    }

    pub fn stats(&self) -> BTreeMap<HashType, CacheStat> {
        self.cache().stats()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.cache().metrics().snapshot()
    }
}
