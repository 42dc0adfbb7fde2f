//! Linear-scan range search.
//!
//! The fallback path when an index cannot be built. Same answer as
//! `VpTree::range` over the same points, only slower.

use std::time::Duration;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use tracing::warn;

use crate::core::{Evaluator, Fingerprint, IndexedPoint, RangeMatch};
use crate::storage::FingerprintSource;
use crate::{Error, Result};

/// Every point of the query's hash type within `max_distance`, in input order
#[cfg(feature = "parallel")]
pub fn linear_range<'a>(
    points: &'a [IndexedPoint],
    query: &Fingerprint,
    max_distance: u32,
    evaluator: Evaluator,
) -> Vec<RangeMatch<'a>> {
    let hash_type = query.hash_type();
    let bit_width = hash_type.bit_width();
    let q = query.bits();

    points
        .par_iter()
        .filter(|p| p.fingerprint.hash_type() == hash_type)
        .filter_map(|p| {
            let d = evaluator.distance(q, p.fingerprint.bits(), bit_width);
            (d <= max_distance).then_some(RangeMatch { point: p, distance: d })
        })
        .collect()
}

#[cfg(not(feature = "parallel"))]
pub fn linear_range<'a>(
    points: &'a [IndexedPoint],
    query: &Fingerprint,
    max_distance: u32,
    evaluator: Evaluator,
) -> Vec<RangeMatch<'a>> {
    let hash_type = query.hash_type();
    let bit_width = hash_type.bit_width();
    let q = query.bits();

    points
        .iter()
        .filter(|p| p.fingerprint.hash_type() == hash_type)
        .filter_map(|p| {
            let d = evaluator.distance(q, p.fingerprint.bits(), bit_width);
            (d <= max_distance).then_some(RangeMatch { point: p, distance: d })
        })
        .collect()
}

/// Fetch candidates straight from the source and scan them.
///
/// The fetch is bounded by `fetch_timeout`; at most `max_candidates` points
/// are scanned.
pub async fn fetch_and_scan(
    source: &dyn FingerprintSource,
    query: &Fingerprint,
    max_distance: u32,
    evaluator: Evaluator,
    max_candidates: usize,
    fetch_timeout: Duration,
) -> Result<Vec<(IndexedPoint, u32)>> {
    let hash_type = query.hash_type();
    let mut candidates = tokio::time::timeout(fetch_timeout, source.fetch_fingerprints(hash_type))
        .await
        .map_err(|_| {
            Error::Source(format!(
                "linear scan fetch for {hash_type} timed out after {fetch_timeout:?}"
            ))
        })??;

    if candidates.len() > max_candidates {
        warn!(
            %hash_type,
            available = candidates.len(),
            scanned = max_candidates,
            "linear scan candidate set truncated"
        );
        candidates.truncate(max_candidates);
    }

    Ok(linear_range(&candidates, query, max_distance, evaluator)
        .into_iter()
        .map(|m| (m.point.clone(), m.distance))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{HashType, VpTree};
    use crate::storage::MemorySource;
    use proptest::prelude::*;

    fn points(values: &[u64]) -> Vec<IndexedPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| IndexedPoint::bare(Fingerprint::from_u64(HashType::Perceptual, v), format!("p{i}")))
            .collect()
    }

    #[test]
    fn test_linear_range_basic() {
        let pts = points(&[0, 1, u64::MAX]);
        let q = Fingerprint::zero(HashType::Perceptual);
        let hits = linear_range(&pts, &q, 6, Evaluator::Table);
        let ids: Vec<_> = hits.iter().map(|m| m.item_id()).collect();
        assert_eq!(ids, vec!["p0", "p1"]);
        assert_eq!(hits[1].distance, 1);
    }

    #[test]
    fn test_linear_range_skips_other_types() {
        let mut pts = points(&[0]);
        pts.push(IndexedPoint::bare(Fingerprint::zero(HashType::Average), "other"));
        let hits = linear_range(&pts, &Fingerprint::zero(HashType::Perceptual), 64, Evaluator::Reference);
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_and_scan_caps_candidates() {
        let source = MemorySource::new();
        for p in points(&[0; 50]) {
            source.insert(p);
        }
        let q = Fingerprint::zero(HashType::Perceptual);
        let hits = fetch_and_scan(&source, &q, 0, Evaluator::Table, 20, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(hits.len(), 20);
    }

    proptest! {
        #[test]
        fn linear_matches_tree(values in prop::collection::vec(any::<u64>(), 0..300), q in any::<u64>(), max in 0u32..=64) {
            let pts = points(&values);
            let tree = VpTree::from_points(HashType::Perceptual, pts.clone()).unwrap();
            let query = Fingerprint::from_u64(HashType::Perceptual, q);

            let mut linear: Vec<_> = linear_range(&pts, &query, max, Evaluator::Table)
                .iter()
                .map(|m| (m.item_id().to_string(), m.distance))
                .collect();
            let mut indexed: Vec<_> = tree.range(&query, max).unwrap()
                .iter()
                .map(|m| (m.item_id().to_string(), m.distance))
                .collect();
            linear.sort();
            indexed.sort();
            prop_assert_eq!(linear, indexed);
        }
    }
}
