//! End-to-end scenarios through `SimilarityEngine`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use magpie::{
    BatchItem, BatchQuery, DisplayMetadata, EngineConfig, Error, Fingerprint, FingerprintSource,
    HashType, IndexedPoint, MemorySource, SimilarityEngine, SimilarityQuery, VpTree,
};

const ZERO_64: &str = "0000000000000000";

fn gallery() -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new());
    source.insert_item(
        "one-bit-off",
        DisplayMetadata::titled("Near duplicate"),
        [
            Fingerprint::from_hex(HashType::Perceptual, "0x0000000000000001").unwrap(),
            Fingerprint::from_u64(HashType::Average, 0),
        ],
    );
    source.insert_item(
        "inverted",
        DisplayMetadata::titled("Negative"),
        [Fingerprint::from_hex(HashType::Perceptual, "FFFFFFFFFFFFFFFF").unwrap()],
    );
    source.insert_item(
        "block",
        DisplayMetadata::titled("Large block hash").with_tags(["scan"]),
        [Fingerprint::from_raw(HashType::Block16, 0b111).unwrap()],
    );
    source
}

fn engine_over(source: Arc<dyn FingerprintSource>) -> SimilarityEngine {
    SimilarityEngine::new(source, EngineConfig::testing()).unwrap()
}

#[tokio::test]
async fn near_duplicate_matches_and_inverse_does_not() {
    let engine = engine_over(gallery());
    let query = SimilarityQuery::new()
        .with_fingerprint("perceptual_hash", ZERO_64)
        .with_threshold(0.9);

    let response = engine.search(&query).await.unwrap();
    assert_eq!(response.item_ids().collect::<Vec<_>>(), vec!["one-bit-off"]);

    let hit = &response.matches[0];
    assert_eq!(hit.per_hash_distance[&HashType::Perceptual], 1);
    assert!((hit.per_hash_similarity[&HashType::Perceptual] - 0.984375).abs() < 1e-12);
    assert_eq!(hit.metadata.title.as_deref(), Some("Near duplicate"));
}

#[tokio::test]
async fn empty_source_returns_no_matches() {
    let engine = engine_over(Arc::new(MemorySource::new()));
    for threshold in [0.0, 0.5, 1.0] {
        let query = SimilarityQuery::new()
            .with_fingerprint("phash", ZERO_64)
            .with_fingerprint("block_hash_16", "0".repeat(32))
            .with_threshold(threshold);
        let response = engine.search(&query).await.unwrap();
        assert!(response.matches.is_empty());
        assert!(!response.no_usable_hash_types);
    }

    let tree = VpTree::empty(HashType::Perceptual);
    let q = Fingerprint::zero(HashType::Perceptual);
    assert!(tree.range(&q, 64).unwrap().is_empty());
}

#[tokio::test]
async fn invalidating_perceptual_hash_rebuilds_only_that_index() {
    let engine = engine_over(gallery());
    engine
        .warm_up(&[HashType::Perceptual, HashType::Average])
        .await
        .unwrap();
    let before = engine.stats();

    tokio::time::sleep(Duration::from_millis(5)).await;
    engine.invalidate(Some("perceptual_hash".parse().unwrap()));

    let query = SimilarityQuery::new().with_fingerprint("perceptual_hash", ZERO_64);
    engine.search(&query).await.unwrap();
    let after = engine.stats();

    let (b, a) = (&before[&HashType::Perceptual], &after[&HashType::Perceptual]);
    assert_ne!(b.built_at, a.built_at);
    assert_ne!(b.build_id, a.build_id);
    assert_eq!(before[&HashType::Average].built_at, after[&HashType::Average].built_at);
    assert_eq!(before[&HashType::Average].build_id, after[&HashType::Average].build_id);
}

#[tokio::test]
async fn format_error_names_the_hash_type() {
    let engine = engine_over(gallery());
    let query = SimilarityQuery::new()
        .with_fingerprint("phash", ZERO_64)
        .with_fingerprint("block16", ZERO_64); // 16 digits, needs 32

    let err = engine.search(&query).await.unwrap_err();
    assert!(err.is_client_error());
    match err {
        Error::Format { hash_type, reason } => {
            assert_eq!(hash_type, "block_hash_16");
            assert!(reason.contains("32"));
        }
        other => panic!("expected a format error, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_hash_types_yield_marker_not_error() {
    let engine = engine_over(gallery());
    let query = SimilarityQuery::new().with_fingerprint("sift_descriptor", "abc");
    let response = engine.search(&query).await.unwrap();
    assert!(response.no_usable_hash_types);
    assert_eq!(response.total_matches, 0);
    assert_eq!(response.params.ignored_hash_types, vec!["sift_descriptor"]);
}

#[tokio::test]
async fn wide_hash_types_search_128_bits() {
    let engine = engine_over(gallery());
    let query = SimilarityQuery::new()
        .with_fingerprint("blockhash16", "0".repeat(32))
        .with_threshold(0.97);
    let response = engine.search(&query).await.unwrap();
    assert_eq!(response.item_ids().collect::<Vec<_>>(), vec!["block"]);
    assert_eq!(response.matches[0].per_hash_distance[&HashType::Block16], 3);
    assert!((response.matches[0].overall_similarity - 125.0 / 128.0).abs() < 1e-12);
}

#[tokio::test]
async fn batch_returns_one_result_set_per_id() {
    let engine = engine_over(gallery());
    let batch = BatchQuery::new()
        .with_item(BatchItem::new("q1").with_fingerprint("phash", ZERO_64))
        .with_item(BatchItem::new("q2").with_fingerprint("phash", "ffffffffffffffff"))
        .with_item(BatchItem::new("q3").with_fingerprint("ahash", "zz"))
        .with_threshold(0.9);

    let response = engine.search_batch(&batch).await.unwrap();
    let ids = |id: &str| -> Vec<String> {
        response
            .get(id)
            .and_then(|o| o.response())
            .map(|r| r.item_ids().map(String::from).collect())
            .unwrap_or_default()
    };
    assert_eq!(ids("q1"), vec!["one-bit-off"]);
    assert_eq!(ids("q2"), vec!["inverted"]);
    assert!(response.get("q3").unwrap().response().is_none());

    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["results"][2]["outcome"]["status"], "rejected");
}

/// Fails every other fetch
struct OutageSource {
    inner: Arc<MemorySource>,
    calls: AtomicUsize,
}

#[async_trait]
impl FingerprintSource for OutageSource {
    async fn fetch_fingerprints(&self, hash_type: HashType) -> magpie::Result<Vec<IndexedPoint>> {
        // Even calls fail (index builds), odd calls succeed (linear scans)
        if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return Err(Error::Source("replica lagging".into()));
        }
        self.inner.fetch_fingerprints(hash_type).await
    }
}

#[tokio::test]
async fn index_build_failure_degrades_to_linear_scan() {
    let source = Arc::new(OutageSource {
        inner: gallery(),
        calls: AtomicUsize::new(0),
    });
    let engine = engine_over(source);

    let query = SimilarityQuery::new()
        .with_fingerprint("phash", ZERO_64)
        .with_threshold(0.9);
    let response = engine.search(&query).await.unwrap();

    assert_eq!(response.item_ids().collect::<Vec<_>>(), vec!["one-bit-off"]);
    assert_eq!(response.params.fallback_hash_types, vec![HashType::Perceptual]);
    assert!(engine.stats().is_empty());
    assert_eq!(engine.metrics().fallbacks, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_queries_share_one_build() {
    let source = gallery();
    let engine = engine_over(source.clone());
    let query = SimilarityQuery::new().with_fingerprint("phash", ZERO_64);

    let searches = (0..16).map(|_| {
        let engine = engine.clone();
        let query = query.clone();
        tokio::spawn(async move { engine.search(&query).await })
    });
    for handle in futures::future::join_all(searches).await {
        assert_eq!(handle.unwrap().unwrap().total_matches, 1);
    }
    assert_eq!(source.fetch_count(), 1);
}
