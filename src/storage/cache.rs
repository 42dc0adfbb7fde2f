//! Index cache: one VP-tree per hash type.
//!
//! ```text
//! get_or_build(t)
//!    │
//!    ├── fresh entry?      → return it (no lock held past the lookup)
//!    ├── build in flight?  → await the shared build (bounded wait)
//!    └── otherwise         → spawn build, publish it as in-flight, await
//!                              fetch (bounded) → spawn_blocking(build tree)
//!                              → install entry if generation unchanged
//! ```
//!
//! Entries are replaced wholesale, never patched. Readers hold an
//! `Arc<CacheEntry>` and keep using it even after a swap.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::FingerprintSource;
use crate::config::EngineConfig;
use crate::core::{Evaluator, HashType, TreeBuilder, VantagePolicy, VpTree};

// =============================================================================
// ERRORS
// =============================================================================

/// Why an index could not be produced. Cloned to every waiter of one build.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum IndexBuildError {
    #[error("data source failed for {hash_type}: {reason}")]
    Source { hash_type: HashType, reason: String },

    #[error("data source timed out after {timeout:?} for {hash_type}")]
    FetchTimeout { hash_type: HashType, timeout: Duration },

    #[error("gave up after {waited:?} waiting for the in-flight {hash_type} build")]
    WaitTimeout { hash_type: HashType, waited: Duration },

    #[error("malformed {hash_type} data: {reason}")]
    Malformed { hash_type: HashType, reason: String },

    #[error("{hash_type} build aborted: {reason}")]
    Aborted { hash_type: HashType, reason: String },
}

impl IndexBuildError {
    pub fn hash_type(&self) -> HashType {
        match self {
            IndexBuildError::Source { hash_type, .. }
            | IndexBuildError::FetchTimeout { hash_type, .. }
            | IndexBuildError::WaitTimeout { hash_type, .. }
            | IndexBuildError::Malformed { hash_type, .. }
            | IndexBuildError::Aborted { hash_type, .. } => *hash_type,
        }
    }
}

type BuildResult = Result<Arc<CacheEntry>, IndexBuildError>;
type BuildFuture = Shared<BoxFuture<'static, BuildResult>>;

// =============================================================================
// ENTRIES AND STATS
// =============================================================================

/// One built index
#[derive(Debug)]
pub struct CacheEntry {
    pub hash_type: HashType,
    pub tree: VpTree,
    /// Wall-clock build time
    pub built_at: SystemTime,
    /// Monotonically increasing per cache, distinguishes rebuilds
    pub build_id: u64,
    built_instant: Instant,
}

impl CacheEntry {
    pub fn age(&self) -> Duration {
        self.built_instant.elapsed()
    }

    #[inline]
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// Introspection for one cached hash type
#[derive(Clone, Debug, Serialize)]
pub struct CacheStat {
    pub size: usize,
    pub built_at: SystemTime,
    pub age: Duration,
    pub depth: usize,
    pub build_id: u64,
}

// =============================================================================
// METRICS
// =============================================================================

/// Cache counters for monitoring
#[derive(Default)]
pub struct CacheMetrics {
    /// Served from a fresh entry
    pub hits: AtomicU64,
    /// Started a rebuild
    pub misses: AtomicU64,
    /// Joined a peer's in-flight rebuild
    pub coalesced: AtomicU64,
    /// Rebuilds completed
    pub builds: AtomicU64,
    /// Rebuilds failed
    pub build_failures: AtomicU64,
    /// Waits abandoned at `build_wait_timeout`
    pub wait_timeouts: AtomicU64,
    /// Queries that fell back to a linear scan
    pub fallbacks: AtomicU64,
}

impl CacheMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        Self::bump(&self.fallbacks);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub builds: u64,
    pub build_failures: u64,
    pub wait_timeouts: u64,
    pub fallbacks: u64,
}

// =============================================================================
// CACHE
// =============================================================================

#[derive(Default)]
struct Slot {
    entry: Option<Arc<CacheEntry>>,
    inflight: Option<BuildFuture>,
    // Bumped by invalidate; stale builds do not install
    generation: u64,
}

#[derive(Clone, Copy, Debug)]
struct CacheSettings {
    ttl: Duration,
    fetch_timeout: Duration,
    build_wait_timeout: Duration,
    policy: VantagePolicy,
    evaluator: Evaluator,
}

struct CacheInner {
    source: Arc<dyn FingerprintSource>,
    settings: CacheSettings,
    slots: Mutex<HashMap<HashType, Slot>>,
    metrics: CacheMetrics,
    next_build_id: AtomicU64,
}

/// Per-hash-type VP-tree cache with single-flight rebuilds.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct IndexCache {
    inner: Arc<CacheInner>,
}

impl IndexCache {
    pub fn new(source: Arc<dyn FingerprintSource>, config: &EngineConfig) -> Self {
        let settings = CacheSettings {
            ttl: config.cache_ttl,
            fetch_timeout: config.fetch_timeout,
            build_wait_timeout: config.build_wait_timeout,
            policy: config.vantage_policy,
            evaluator: config.evaluator,
        };
        Self {
            inner: Arc::new(CacheInner {
                source,
                settings,
                slots: Mutex::new(HashMap::new()),
                metrics: CacheMetrics::default(),
                next_build_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.settings.ttl
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// The data source rebuilds read from
    pub fn source(&self) -> &Arc<dyn FingerprintSource> {
        &self.inner.source
    }

    /// Fresh index for `hash_type`, building it if missing or expired.
    ///
    /// Concurrent callers for the same type share one rebuild.
    pub async fn get_or_build(&self, hash_type: HashType) -> BuildResult {
        let inner = &self.inner;
        let build = {
            let mut slots = inner.slots.lock();
            let slot = slots.entry(hash_type).or_default();

            if let Some(entry) = &slot.entry {
                if entry.is_fresh(inner.settings.ttl) {
                    CacheMetrics::bump(&inner.metrics.hits);
                    debug!(%hash_type, build_id = entry.build_id, "index cache hit");
                    return Ok(entry.clone());
                }
            }

            if let Some(build) = slot.inflight.clone() {
                CacheMetrics::bump(&inner.metrics.coalesced);
                debug!(%hash_type, "joining in-flight index build");
                build
            } else {
                CacheMetrics::bump(&inner.metrics.misses);
                let build = Self::start_build(inner.clone(), hash_type, slot.generation);
                slot.inflight = Some(build.clone());
                build
            }
        };

        let waited = inner.settings.build_wait_timeout;
        match tokio::time::timeout(waited, build).await {
            Ok(result) => result,
            Err(_) => {
                CacheMetrics::bump(&inner.metrics.wait_timeouts);
                warn!(%hash_type, ?waited, "timed out waiting for index build");
                Err(IndexBuildError::WaitTimeout { hash_type, waited })
            }
        }
    }

    /// Spawn the build so it finishes even if every waiter gives up
    fn start_build(inner: Arc<CacheInner>, hash_type: HashType, generation: u64) -> BuildFuture {
        let task = tokio::spawn(Self::run_build(inner, hash_type, generation));
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(IndexBuildError::Aborted {
                    hash_type,
                    reason: e.to_string(),
                }),
            }
        }
        .boxed()
        .shared()
    }

    async fn run_build(inner: Arc<CacheInner>, hash_type: HashType, generation: u64) -> BuildResult {
        let started = Instant::now();
        let built = Self::fetch_and_build(&inner, hash_type).await;

        let mut slots = inner.slots.lock();
        let slot = slots.entry(hash_type).or_default();
        let current = slot.generation == generation;
        if current {
            slot.inflight = None;
        }

        match built {
            Ok(tree) => {
                let entry = Arc::new(CacheEntry {
                    hash_type,
                    built_at: SystemTime::now(),
                    build_id: inner.next_build_id.fetch_add(1, Ordering::Relaxed),
                    built_instant: Instant::now(),
                    tree,
                });
                CacheMetrics::bump(&inner.metrics.builds);
                info!(
                    %hash_type,
                    points = entry.tree.len(),
                    depth = entry.tree.depth(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    installed = current,
                    "built index"
                );
                if current {
                    slot.entry = Some(entry.clone());
                }
                Ok(entry)
            }
            Err(e) => {
                CacheMetrics::bump(&inner.metrics.build_failures);
                warn!(%hash_type, error = %e, "index build failed");
                Err(e)
            }
        }
    }

    async fn fetch_and_build(inner: &CacheInner, hash_type: HashType) -> Result<VpTree, IndexBuildError> {
        let settings = inner.settings;
        let fetch = inner.source.fetch_fingerprints(hash_type);
        let points = match tokio::time::timeout(settings.fetch_timeout, fetch).await {
            Ok(Ok(points)) => points,
            Ok(Err(e)) => {
                return Err(IndexBuildError::Source {
                    hash_type,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(IndexBuildError::FetchTimeout {
                    hash_type,
                    timeout: settings.fetch_timeout,
                })
            }
        };

        // Tree construction is CPU-bound
        let built = tokio::task::spawn_blocking(move || {
            let mut builder = TreeBuilder::new(hash_type)
                .with_policy(settings.policy)
                .with_evaluator(settings.evaluator);
            builder.extend(points);
            builder.build()
        })
        .await
        .map_err(|e| IndexBuildError::Aborted {
            hash_type,
            reason: e.to_string(),
        })?;

        built.map_err(|e| IndexBuildError::Malformed {
            hash_type,
            reason: e.to_string(),
        })
    }

    /// Build the given types concurrently; returns point counts per type
    pub async fn warm_up(
        &self,
        hash_types: &[HashType],
    ) -> BTreeMap<HashType, Result<usize, IndexBuildError>> {
        let builds = hash_types.iter().map(|&t| async move {
            (t, self.get_or_build(t).await.map(|entry| entry.tree.len()))
        });
        futures::future::join_all(builds).await.into_iter().collect()
    }

    /// Drop the entry for one hash type, or every entry when `None`.
    ///
    /// An in-flight build for an invalidated type still answers its waiters
    /// but is not installed.
    pub fn invalidate(&self, hash_type: Option<HashType>) {
        let mut slots = self.inner.slots.lock();
        let drop_slot = |t: HashType, slot: &mut Slot| {
            slot.entry = None;
            slot.inflight = None;
            slot.generation += 1;
            debug!(hash_type = %t, generation = slot.generation, "invalidated index");
        };
        match hash_type {
            Some(t) => {
                if let Some(slot) = slots.get_mut(&t) {
                    drop_slot(t, slot);
                }
            }
            None => {
                for (&t, slot) in slots.iter_mut() {
                    drop_slot(t, slot);
                }
            }
        }
    }

    /// Size, build time and age of every cached index. No side effects.
    pub fn stats(&self) -> BTreeMap<HashType, CacheStat> {
        self.inner
            .slots
            .lock()
            .iter()
            .filter_map(|(&t, slot)| {
                let entry = slot.entry.as_ref()?;
                Some((
                    t,
                    CacheStat {
                        size: entry.tree.len(),
                        built_at: entry.built_at,
                        age: entry.age(),
                        depth: entry.tree.depth(),
                        build_id: entry.build_id,
                    },
                ))
            })
            .collect()
    }
}
