//! Storage module - data source contract and the index cache
//!
//! # Layers
//!
//! - **FingerprintSource**: narrow fetch contract onto the system of record
//! - **MemorySource**: in-process source (tests, demos, small deployments)
//! - **IndexCache**: one VP-tree per hash type, TTL + single-flight rebuilds

pub mod cache;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::core::{DisplayMetadata, Fingerprint, HashType, IndexedPoint};
use crate::Result;

pub use cache::{
    CacheEntry, CacheMetrics, CacheStat, IndexBuildError, IndexCache, MetricsSnapshot,
};

// =============================================================================
// DATA SOURCE CONTRACT
// =============================================================================

/// Read side of the system of record.
///
/// Returns every stored item holding a fingerprint of `hash_type`, with
/// enough metadata to render a result. Must be side-effect free and safe to
/// call repeatedly and concurrently.
#[async_trait]
pub trait FingerprintSource: Send + Sync {
    async fn fetch_fingerprints(&self, hash_type: HashType) -> Result<Vec<IndexedPoint>>;
}

// =============================================================================
// IN-MEMORY SOURCE
// =============================================================================

/// In-process `FingerprintSource`
pub struct MemorySource {
    points: RwLock<HashMap<HashType, Vec<IndexedPoint>>>,
    fetches: AtomicU64,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            points: RwLock::new(HashMap::new()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Add one point under its fingerprint's hash type
    pub fn insert(&self, point: IndexedPoint) {
        self.points
            .write()
            .entry(point.fingerprint.hash_type())
            .or_default()
            .push(point);
    }

    /// Add an item with one fingerprint per hash type, sharing metadata
    pub fn insert_item<I>(&self, item_id: &str, metadata: DisplayMetadata, fingerprints: I)
    where
        I: IntoIterator<Item = Fingerprint>,
    {
        let metadata = std::sync::Arc::new(metadata);
        let mut points = self.points.write();
        for fingerprint in fingerprints {
            points
                .entry(fingerprint.hash_type())
                .or_default()
                .push(IndexedPoint {
                    fingerprint,
                    item_id: item_id.to_string(),
                    metadata: metadata.clone(),
                });
        }
    }

    /// Remove every fingerprint of an item. Returns how many were removed.
    pub fn remove_item(&self, item_id: &str) -> usize {
        let mut removed = 0;
        for list in self.points.write().values_mut() {
            let before = list.len();
            list.retain(|p| p.item_id != item_id);
            removed += before - list.len();
        }
        removed
    }

    /// Number of points stored for a hash type
    pub fn len(&self, hash_type: HashType) -> usize {
        self.points.read().get(&hash_type).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.points.read().values().all(Vec::is_empty)
    }

    /// How many times `fetch_fingerprints` has been called
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FingerprintSource for MemorySource {
    async fn fetch_fingerprints(&self, hash_type: HashType) -> Result<Vec<IndexedPoint>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self.points.read().get(&hash_type).cloned().unwrap_or_default())
    }
}
