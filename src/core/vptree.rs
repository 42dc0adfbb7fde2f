//! Vantage-point tree over Hamming space.
//!
//! ```text
//!                 ┌──────────────────────┐
//!                 │ vantage v, radius r  │
//!                 └──────────┬───────────┘
//!            d(v,p) <= r     │     d(v,p) > r
//!               ┌────────────┴────────────┐
//!             near                       far
//! ```
//!
//! Immutable after build. A rebuild produces a brand-new tree; callers share
//! it through an `Arc` and never observe a half-built one. Range queries are
//! exact: same matches as a linear scan, for any tree shape.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::{Evaluator, Fingerprint, HashType, IndexedPoint};
use crate::{Error, Result};

/// Seed used by the default vantage policy
pub const DEFAULT_VANTAGE_SEED: u64 = 0x5EED;

// =============================================================================
// VANTAGE POLICY
// =============================================================================

/// How each node picks its vantage point.
///
/// `First` is the cheapest but degrades toward a linked list on sorted or
/// adversarial input. `Seeded` is random yet reproducible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum VantagePolicy {
    /// Always the first remaining point
    First,
    /// Uniformly random, from a seeded RNG
    Seeded { seed: u64 },
    /// Point furthest from the bitwise-majority centroid
    FurthestFromCentroid,
}

impl Default for VantagePolicy {
    fn default() -> Self {
        VantagePolicy::Seeded { seed: DEFAULT_VANTAGE_SEED }
    }
}

impl VantagePolicy {
    /// Parse `first`, `seeded:<n>` or `furthest`
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "first" => Some(VantagePolicy::First),
            "furthest" | "furthest_from_centroid" => Some(VantagePolicy::FurthestFromCentroid),
            "seeded" | "random" => Some(VantagePolicy::default()),
            _ => {
                let seed = s.strip_prefix("seeded:")?.parse().ok()?;
                Some(VantagePolicy::Seeded { seed })
            }
        }
    }

    fn select(
        self,
        points: &[IndexedPoint],
        evaluator: Evaluator,
        bit_width: u32,
        rng: Option<&mut StdRng>,
    ) -> usize {
        match (self, rng) {
            (VantagePolicy::Seeded { .. }, Some(rng)) => rng.random_range(0..points.len()),
            (VantagePolicy::FurthestFromCentroid, _) => {
                furthest_from_centroid(points, evaluator, bit_width)
            }
            _ => 0,
        }
    }
}

/// Index of the point furthest from the per-bit majority vote (lowest index on ties)
fn furthest_from_centroid(points: &[IndexedPoint], evaluator: Evaluator, bit_width: u32) -> usize {
    let mut ones = vec![0usize; bit_width as usize];
    for p in points {
        let bits = p.fingerprint.bits();
        for (pos, count) in ones.iter_mut().enumerate() {
            *count += ((bits >> pos) & 1) as usize;
        }
    }

    let half = points.len() / 2;
    let centroid = ones
        .iter()
        .enumerate()
        .filter(|(_, &count)| count > half)
        .fold(0u128, |acc, (pos, _)| acc | (1u128 << pos));

    let mut best = 0;
    let mut best_distance = 0;
    for (i, p) in points.iter().enumerate() {
        let d = evaluator.distance(centroid, p.fingerprint.bits(), bit_width);
        if d > best_distance {
            best = i;
            best_distance = d;
        }
    }
    best
}

// =============================================================================
// NODES AND MATCHES
// =============================================================================

/// Tree node. Children are arena indices.
#[derive(Debug)]
struct Node {
    point: IndexedPoint,
    radius: u32,
    near: Option<usize>,
    far: Option<usize>,
}

#[derive(Clone, Copy)]
enum Side {
    Near,
    Far,
}

/// A point within range of a query
#[derive(Clone, Copy, Debug)]
pub struct RangeMatch<'a> {
    pub point: &'a IndexedPoint,
    pub distance: u32,
}

impl RangeMatch<'_> {
    #[inline]
    pub fn item_id(&self) -> &str {
        &self.point.item_id
    }
}

/// Work done by one range query
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RangeStats {
    /// Nodes whose vantage point was compared against the query
    pub visited: usize,
    pub matched: usize,
}

// =============================================================================
// BUILDER
// =============================================================================

/// Builder for VpTree (mutable during construction)
pub struct TreeBuilder {
    hash_type: HashType,
    policy: VantagePolicy,
    evaluator: Evaluator,
    points: Vec<IndexedPoint>,
}

impl TreeBuilder {
    /// Create new builder for one hash type
    pub fn new(hash_type: HashType) -> Self {
        Self {
            hash_type,
            policy: VantagePolicy::default(),
            evaluator: Evaluator::default(),
            points: Vec::new(),
        }
    }

    pub fn with_policy(mut self, policy: VantagePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Insert a point
    #[inline]
    pub fn insert(&mut self, point: IndexedPoint) {
        self.points.push(point);
    }

    /// Insert many points
    pub fn extend<I: IntoIterator<Item = IndexedPoint>>(&mut self, points: I) {
        self.points.extend(points);
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Freeze into an immutable tree.
    ///
    /// Fails if any point carries a different hash type.
    pub fn build(self) -> Result<VpTree> {
        let hash_type = self.hash_type;
        if let Some(bad) = self.points.iter().find(|p| p.fingerprint.hash_type() != hash_type) {
            return Err(Error::HashTypeMismatch {
                expected: hash_type,
                got: bad.fingerprint.hash_type(),
            });
        }

        let bit_width = hash_type.bit_width();
        let evaluator = self.evaluator;
        let mut rng = match self.policy {
            VantagePolicy::Seeded { seed } => Some(StdRng::seed_from_u64(seed)),
            _ => None,
        };

        let mut nodes: Vec<Node> = Vec::with_capacity(self.points.len());
        let mut depth = 0;

        // Explicit stack: degenerate trees can be as deep as the point count
        let mut work: Vec<(Vec<IndexedPoint>, Option<(usize, Side)>, usize)> =
            vec![(self.points, None, 1)];

        while let Some((mut points, parent, level)) = work.pop() {
            if points.is_empty() {
                continue;
            }
            depth = depth.max(level);

            let chosen = self.policy.select(&points, evaluator, bit_width, rng.as_mut());
            let vantage = points.swap_remove(chosen);
            let vbits = vantage.fingerprint.bits();

            let mut rest: Vec<(u32, IndexedPoint)> = points
                .into_iter()
                .map(|p| (evaluator.distance(vbits, p.fingerprint.bits(), bit_width), p))
                .collect();
            rest.sort_by_key(|(d, _)| *d);

            // Median distance; ties with the median stay near
            let radius = rest.get(rest.len() / 2).map(|(d, _)| *d).unwrap_or(0);
            let split = rest.partition_point(|(d, _)| *d <= radius);
            let far: Vec<IndexedPoint> = rest.split_off(split).into_iter().map(|(_, p)| p).collect();
            let near: Vec<IndexedPoint> = rest.into_iter().map(|(_, p)| p).collect();

            let idx = nodes.len();
            nodes.push(Node { point: vantage, radius, near: None, far: None });
            match parent {
                Some((p, Side::Near)) => nodes[p].near = Some(idx),
                Some((p, Side::Far)) => nodes[p].far = Some(idx),
                None => {}
            }

            work.push((far, Some((idx, Side::Far)), level + 1));
            work.push((near, Some((idx, Side::Near)), level + 1));
        }

        Ok(VpTree {
            hash_type,
            evaluator,
            nodes: nodes.into_boxed_slice(),
            depth,
        })
    }
}

// =============================================================================
// IMMUTABLE TREE
// =============================================================================

/// Immutable VP-tree for one hash type
///
/// Once built, cannot be mutated. Safe for concurrent access.
/// Update = build a new tree from the system of record, swap the `Arc`.
#[derive(Debug)]
pub struct VpTree {
    hash_type: HashType,
    evaluator: Evaluator,
    // nodes[0] is the root
    nodes: Box<[Node]>,
    depth: usize,
}

impl VpTree {
    /// Create empty tree
    pub fn empty(hash_type: HashType) -> Self {
        Self {
            hash_type,
            evaluator: Evaluator::default(),
            nodes: Box::new([]),
            depth: 0,
        }
    }

    /// Build with default policy and evaluator
    pub fn from_points(hash_type: HashType, points: Vec<IndexedPoint>) -> Result<Self> {
        let mut builder = TreeBuilder::new(hash_type);
        builder.extend(points);
        builder.build()
    }

    /// Number of points
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn hash_type(&self) -> HashType {
        self.hash_type
    }

    /// Longest root-to-leaf path (0 for an empty tree)
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// All indexed points, in arena order
    pub fn points(&self) -> impl Iterator<Item = &IndexedPoint> {
        self.nodes.iter().map(|n| &n.point)
    }

    fn check_query(&self, query: &Fingerprint) -> Result<()> {
        if query.hash_type() != self.hash_type {
            return Err(Error::HashTypeMismatch {
                expected: self.hash_type,
                got: query.hash_type(),
            });
        }
        Ok(())
    }

    // ========== Range Query ==========

    /// All points within `max_distance` of `query`
    pub fn range(&self, query: &Fingerprint, max_distance: u32) -> Result<Vec<RangeMatch<'_>>> {
        self.range_with_stats(query, max_distance).map(|(matches, _)| matches)
    }

    /// Range query that also reports how many nodes were visited
    pub fn range_with_stats(
        &self,
        query: &Fingerprint,
        max_distance: u32,
    ) -> Result<(Vec<RangeMatch<'_>>, RangeStats)> {
        self.check_query(query)?;

        let mut matches = Vec::new();
        let mut stats = RangeStats::default();
        if self.nodes.is_empty() {
            return Ok((matches, stats));
        }

        let bit_width = self.hash_type.bit_width();
        let q = query.bits();
        let max = max_distance as i64;
        let mut stack = vec![0usize];

        while let Some(i) = stack.pop() {
            let node = &self.nodes[i];
            stats.visited += 1;

            let d = self.evaluator.distance(q, node.point.fingerprint.bits(), bit_width);
            if d <= max_distance {
                matches.push(RangeMatch { point: &node.point, distance: d });
            }

            let d = d as i64;
            let radius = node.radius as i64;
            // Triangle inequality: anything within max of q is within d + max of v
            if let Some(far) = node.far {
                if d + max >= radius {
                    stack.push(far);
                }
            }
            if let Some(near) = node.near {
                if d - max <= radius {
                    stack.push(near);
                }
            }
        }

        stats.matched = matches.len();
        Ok((matches, stats))
    }

    // ========== k-NN ==========

    /// Exact k nearest neighbours, sorted by distance then item id
    pub fn nearest(&self, query: &Fingerprint, k: usize) -> Result<Vec<RangeMatch<'_>>> {
        self.check_query(query)?;
        if k == 0 || self.nodes.is_empty() {
            return Ok(Vec::new());
        }

        let bit_width = self.hash_type.bit_width();
        let q = query.bits();

        // Max-heap on (distance, item_id): the top is the current worst of the best k
        let mut best: BinaryHeap<Candidate<'_>> = BinaryHeap::with_capacity(k + 1);
        let mut stack = vec![0usize];

        while let Some(i) = stack.pop() {
            let node = &self.nodes[i];
            let d = self.evaluator.distance(q, node.point.fingerprint.bits(), bit_width);

            let candidate = Candidate { distance: d, point: &node.point };
            if best.len() < k {
                best.push(candidate);
            } else if best.peek().is_some_and(|worst| candidate < *worst) {
                best.pop();
                best.push(candidate);
            }

            let tau = if best.len() < k {
                i64::MAX / 2
            } else {
                best.peek().map(|c| c.distance as i64).unwrap_or(i64::MAX / 2)
            };
            let d = d as i64;
            let radius = node.radius as i64;
            let visit_near = node.near.filter(|_| d - tau <= radius);
            let visit_far = node.far.filter(|_| d + tau >= radius);

            // Pop the more promising side first
            if d <= radius {
                stack.extend(visit_far);
                stack.extend(visit_near);
            } else {
                stack.extend(visit_near);
                stack.extend(visit_far);
            }
        }

        let mut out: Vec<RangeMatch<'_>> = best
            .into_iter()
            .map(|c| RangeMatch { point: c.point, distance: c.distance })
            .collect();
        out.sort_by(|a, b| a.distance.cmp(&b.distance).then_with(|| a.item_id().cmp(b.item_id())));
        Ok(out)
    }
}

struct Candidate<'a> {
    distance: u32,
    point: &'a IndexedPoint,
}

impl Ord for Candidate<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .cmp(&other.distance)
            .then_with(|| self.point.item_id.cmp(&other.point.item_id))
    }
}

impl PartialOrd for Candidate<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn point(hash_type: HashType, bits: u64, id: usize) -> IndexedPoint {
        IndexedPoint::bare(Fingerprint::from_u64(hash_type, bits), format!("item-{id}"))
    }

    fn points(values: &[u64]) -> Vec<IndexedPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| point(HashType::Perceptual, v, i))
            .collect()
    }

    /// Pseudo-random 64-bit values (splitmix64)
    fn random_values(n: usize, seed: u64) -> Vec<u64> {
        let mut state = seed;
        (0..n)
            .map(|_| {
                state = state.wrapping_add(0x9E3779B97F4A7C15);
                let mut z = state;
                z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
                z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
                z ^ (z >> 31)
            })
            .collect()
    }

    fn linear(points: &[IndexedPoint], query: &Fingerprint, max: u32) -> BTreeMap<String, u32> {
        points
            .iter()
            .filter_map(|p| {
                let d = p.fingerprint.hamming(query);
                (d <= max).then(|| (p.item_id.clone(), d))
            })
            .collect()
    }

    fn as_map(matches: &[RangeMatch<'_>]) -> BTreeMap<String, u32> {
        matches.iter().map(|m| (m.item_id().to_string(), m.distance)).collect()
    }

    fn build(pts: Vec<IndexedPoint>, policy: VantagePolicy) -> VpTree {
        let mut builder = TreeBuilder::new(HashType::Perceptual).with_policy(policy);
        builder.extend(pts);
        builder.build().unwrap()
    }

    #[test]
    fn test_empty_tree() {
        let tree = build(Vec::new(), VantagePolicy::default());
        assert!(tree.is_empty());
        assert_eq!(tree.depth(), 0);

        let q = Fingerprint::zero(HashType::Perceptual);
        assert!(tree.range(&q, 64).unwrap().is_empty());
        assert!(tree.nearest(&q, 5).unwrap().is_empty());
    }

    #[test]
    fn test_single_leaf() {
        let tree = build(points(&[7]), VantagePolicy::First);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.depth(), 1);

        let q = Fingerprint::from_u64(HashType::Perceptual, 7);
        let hits = tree.range(&q, 0).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].distance, 0);
    }

    #[test]
    fn test_threshold_scenario() {
        let tree = build(points(&[0, 1, u64::MAX]), VantagePolicy::default());
        let q = Fingerprint::zero(HashType::Perceptual);

        // threshold 0.9 on 64 bits -> floor(0.1 * 64) = 6
        let max = ((1.0 - 0.9) * 64.0f64).floor() as u32;
        let hits = as_map(&tree.range(&q, max).unwrap());
        assert_eq!(hits.get("item-1"), Some(&1));
        assert_eq!(hits.get("item-0"), Some(&0));
        assert!(!hits.contains_key("item-2"));
    }

    #[test]
    fn test_rejects_mixed_hash_types() {
        let mut builder = TreeBuilder::new(HashType::Perceptual);
        builder.insert(point(HashType::Perceptual, 1, 0));
        builder.insert(point(HashType::Average, 1, 1));
        assert!(matches!(builder.build(), Err(Error::HashTypeMismatch { .. })));

        let tree = build(points(&[1]), VantagePolicy::First);
        let q = Fingerprint::zero(HashType::Average);
        assert!(tree.range(&q, 3).is_err());
    }

    #[test]
    fn test_duplicates_and_identical_points() {
        let tree = build(points(&[42; 50]), VantagePolicy::First);
        let q = Fingerprint::from_u64(HashType::Perceptual, 42);
        assert_eq!(tree.range(&q, 0).unwrap().len(), 50);

        let q = Fingerprint::from_u64(HashType::Perceptual, 43);
        assert!(tree.range(&q, 0).unwrap().is_empty());
        assert_eq!(tree.range(&q, 1).unwrap().len(), 50);
    }

    #[test]
    fn test_sorted_input_with_first_policy_does_not_overflow() {
        // Worst case for First: a chain as deep as the input
        let values: Vec<u64> = (0..10_000u64).collect();
        let pts = points(&values);
        let tree = build(pts.clone(), VantagePolicy::First);
        let q = Fingerprint::from_u64(HashType::Perceptual, 0xFF);
        assert_eq!(as_map(&tree.range(&q, 10).unwrap()), linear(&pts, &q, 10));
    }

    #[test]
    fn test_policies_agree_at_ten_thousand() {
        let pts = points(&random_values(10_000, 7));
        let queries = random_values(20, 99);

        for policy in [
            VantagePolicy::First,
            VantagePolicy::Seeded { seed: 1 },
            VantagePolicy::FurthestFromCentroid,
        ] {
            let tree = build(pts.clone(), policy);
            assert_eq!(tree.len(), 10_000);
            for &qv in &queries {
                let q = Fingerprint::from_u64(HashType::Perceptual, qv);
                for max in [0, 8, 24, 32, 64] {
                    assert_eq!(
                        as_map(&tree.range(&q, max).unwrap()),
                        linear(&pts, &q, max),
                        "policy {:?} max {}",
                        policy,
                        max
                    );
                }
            }
        }
    }

    #[test]
    fn test_range_prunes() {
        let pts = points(&random_values(5_000, 3));
        let tree = build(pts, VantagePolicy::default());
        let q = Fingerprint::from_u64(HashType::Perceptual, 0x1234_5678_9abc_def0);
        let (_, stats) = tree.range_with_stats(&q, 2).unwrap();
        assert!(stats.visited < tree.len(), "visited {} of {}", stats.visited, tree.len());
    }

    #[test]
    fn test_seeded_policy_is_reproducible() {
        let pts = points(&random_values(500, 11));
        let a = build(pts.clone(), VantagePolicy::Seeded { seed: 5 });
        let b = build(pts, VantagePolicy::Seeded { seed: 5 });
        let ids_a: Vec<_> = a.points().map(|p| p.item_id.clone()).collect();
        let ids_b: Vec<_> = b.points().map(|p| p.item_id.clone()).collect();
        assert_eq!(ids_a, ids_b);
        assert_eq!(a.depth(), b.depth());
    }

    #[test]
    fn test_furthest_from_centroid_picks_outlier() {
        let pts = points(&[0, 0, 1, u64::MAX]);
        assert_eq!(furthest_from_centroid(&pts, Evaluator::Table, 64), 3);
    }

    #[test]
    fn test_nearest_matches_brute_force() {
        let pts = points(&random_values(2_000, 21));
        let tree = build(pts.clone(), VantagePolicy::default());

        for qv in random_values(10, 5) {
            let q = Fingerprint::from_u64(HashType::Perceptual, qv);
            let mut expected: Vec<(u32, String)> = pts
                .iter()
                .map(|p| (p.fingerprint.hamming(&q), p.item_id.clone()))
                .collect();
            expected.sort();
            expected.truncate(10);

            let got: Vec<(u32, String)> = tree
                .nearest(&q, 10)
                .unwrap()
                .into_iter()
                .map(|m| (m.distance, m.item_id().to_string()))
                .collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_128_bit_tree() {
        let pts: Vec<IndexedPoint> = random_values(300, 8)
            .chunks(2)
            .enumerate()
            .map(|(i, pair)| {
                let bits = (pair[0] as u128) << 64 | pair[1] as u128;
                IndexedPoint::bare(Fingerprint::from_raw(HashType::Block16, bits).unwrap(), format!("b{i}"))
            })
            .collect();
        let mut builder = TreeBuilder::new(HashType::Block16).with_evaluator(Evaluator::Reference);
        builder.extend(pts.clone());
        let tree = builder.build().unwrap();

        let q = pts[17].fingerprint;
        for max in [0, 40, 64, 128] {
            assert_eq!(as_map(&tree.range(&q, max).unwrap()), linear(&pts, &q, max));
        }
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(VantagePolicy::parse("first"), Some(VantagePolicy::First));
        assert_eq!(VantagePolicy::parse("seeded:12"), Some(VantagePolicy::Seeded { seed: 12 }));
        assert_eq!(VantagePolicy::parse("furthest"), Some(VantagePolicy::FurthestFromCentroid));
        assert_eq!(VantagePolicy::parse("seeded:x"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_range_equals_linear_scan(
            values in proptest::collection::vec(any::<u64>(), 0..1500),
            query in any::<u64>(),
            max in 0u32..=64,
            seed in any::<u64>(),
        ) {
            let pts = points(&values);
            let tree = build(pts.clone(), VantagePolicy::Seeded { seed });
            let q = Fingerprint::from_u64(HashType::Perceptual, query);
            prop_assert_eq!(as_map(&tree.range(&q, max).unwrap()), linear(&pts, &q, max));
        }

        #[test]
        fn prop_clustered_range_equals_linear_scan(
            base in any::<u64>(),
            flips in proptest::collection::vec(proptest::collection::vec(0u32..64, 0..6), 0..800),
            max in 0u32..=12,
        ) {
            // Near-duplicates around one base hash, the realistic workload
            let values: Vec<u64> = flips
                .iter()
                .map(|bits| bits.iter().fold(base, |acc, &b| acc ^ (1u64 << b)))
                .collect();
            let pts = points(&values);
            let tree = build(pts.clone(), VantagePolicy::First);
            let q = Fingerprint::from_u64(HashType::Perceptual, base);
            prop_assert_eq!(as_map(&tree.range(&q, max).unwrap()), linear(&pts, &q, max));
        }
    }
}
