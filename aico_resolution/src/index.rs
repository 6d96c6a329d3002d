//! Incremental approximate-nearest-neighbor index over entity embeddings.
//!
//! Backed by an HNSW graph so both insert and query stay sub-linear in the
//! number of indexed vectors. This exists specifically to replace pairwise
//! brute-force comparison, which stalls for minutes once a user accumulates
//! a few dozen entities; the index keeps per-batch resolution fast into the
//! tens of thousands of nodes.
//!
//! Vectors are L2-normalized on the way in, so Euclidean distance orders
//! neighbors the same way cosine similarity does. The graph is built over
//! L2 distance; reported similarity scores come from dotting the query
//! against the retained unit vectors, which for unit vectors is exactly
//! cosine.

use std::collections::HashMap;

use aico_config::IndexConfig;
use aico_core::NodeId;
use hnsw_rs::prelude::{DistL2, Hnsw};

const INITIAL_CAPACITY: usize = 1024;

/// Returns a copy of `v` scaled to unit L2 norm. Zero vectors pass through.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Cosine similarity of two vectors, clamped to [0, 1] for thresholding.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

/// Growable HNSW index mapping node ids to embedding vectors.
///
/// One instance per user scope; the pipeline passes the instance through
/// explicitly rather than sharing a global singleton.
pub struct SimilarityIndex {
    params: IndexConfig,
    hnsw: Hnsw<'static, f32, DistL2>,
    /// Slot → node id, aligned with insertion order.
    ids: Vec<NodeId>,
    /// Slot → normalized vector, retained for capacity-growth rebuilds.
    vectors: Vec<Vec<f32>>,
    /// Node id → slot, for idempotent upsert.
    slots: HashMap<NodeId, usize>,
    capacity: usize,
}

impl SimilarityIndex {
    pub fn new(params: IndexConfig) -> Self {
        Self::with_capacity(params, INITIAL_CAPACITY)
    }

    /// Creates an index with an explicit initial capacity (grown
    /// automatically when exceeded).
    pub fn with_capacity(params: IndexConfig, capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let hnsw = Self::build_hnsw(&params, capacity);
        Self {
            params,
            hnsw,
            ids: Vec::new(),
            vectors: Vec::new(),
            slots: HashMap::new(),
            capacity,
        }
    }

    fn build_hnsw(params: &IndexConfig, capacity: usize) -> Hnsw<'static, f32, DistL2> {
        let max_layer = 16.min((capacity as f32).ln().trunc() as usize).max(1);
        Hnsw::new(
            params.max_connections,
            capacity,
            max_layer,
            params.ef_construction,
            DistL2 {},
        )
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether a node id is already indexed.
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.slots.contains_key(&node_id)
    }

    /// Inserts a vector for `node_id`. Re-inserting a known id is a no-op;
    /// returns whether the vector was actually added.
    pub fn insert(&mut self, node_id: NodeId, embedding: &[f32]) -> bool {
        if self.slots.contains_key(&node_id) {
            return false;
        }
        if self.ids.len() == self.capacity {
            self.grow();
        }
        let normalized = l2_normalize(embedding);
        let slot = self.ids.len();
        self.hnsw.insert((&normalized[..], slot));
        self.ids.push(node_id);
        self.vectors.push(normalized);
        self.slots.insert(node_id, slot);
        true
    }

    /// Doubles capacity and rebuilds the HNSW graph from retained vectors.
    /// Amortized over the doubling schedule this keeps insert O(log N).
    fn grow(&mut self) {
        self.capacity *= 2;
        let hnsw = Self::build_hnsw(&self.params, self.capacity);
        for (slot, v) in self.vectors.iter().enumerate() {
            hnsw.insert((&v[..], slot));
        }
        self.hnsw = hnsw;
    }

    /// Returns up to `k` nearest indexed vectors as (node id, similarity),
    /// descending by similarity. Empty result on an empty index.
    pub fn query(&self, embedding: &[f32], k: usize) -> Vec<(NodeId, f32)> {
        if self.ids.is_empty() || k == 0 {
            return Vec::new();
        }
        let q = l2_normalize(embedding);
        let ef = self.params.ef_search.max(k);
        let neighbours = self.hnsw.search(&q[..], k.min(self.ids.len()), ef);

        let mut results: Vec<(NodeId, f32)> = neighbours
            .into_iter()
            .filter_map(|n| {
                let id = *self.ids.get(n.d_id)?;
                // Exact score from the retained unit vector: dot of unit
                // vectors is cosine, clamped for thresholding.
                let v = self.vectors.get(n.d_id)?;
                let dot: f32 = q.iter().zip(v.iter()).map(|(x, y)| x * y).sum();
                Some((id, dot.clamp(0.0, 1.0)))
            })
            .collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(k);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> IndexConfig {
        IndexConfig::default()
    }

    /// Deterministic pseudo-random unit vector.
    fn unit_vec(dim: usize, seed: u64) -> Vec<f32> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let v: Vec<f32> = (0..dim)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                ((state >> 33) as f32 / u32::MAX as f32) - 0.5
            })
            .collect();
        l2_normalize(&v)
    }

    #[test]
    fn test_empty_index_query_is_empty() {
        let index = SimilarityIndex::new(params());
        assert!(index.is_empty());
        assert!(index.query(&[1.0, 0.0], 5).is_empty());
    }

    #[test]
    fn test_insert_and_exact_query() {
        let mut index = SimilarityIndex::new(params());
        assert!(index.insert(1, &[1.0, 0.0, 0.0]));
        assert!(index.insert(2, &[0.0, 1.0, 0.0]));

        let results = index.query(&[1.0, 0.0, 0.0], 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 1);
        assert!(results[0].1 > 0.99);
        assert!(results[0].1 >= results[1].1, "descending order");
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut index = SimilarityIndex::new(params());
        assert!(index.insert(1, &[1.0, 0.0]));
        assert!(!index.insert(1, &[1.0, 0.0]));
        assert_eq!(index.len(), 1);
        assert!(index.contains(1));

        let results = index.query(&[1.0, 0.0], 5);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_anticorrelated_vectors_are_indexable() {
        // Real embeddings routinely have negative pairwise dot products;
        // insert and query must handle them, reporting similarity 0 for
        // opposed directions rather than failing.
        let mut index = SimilarityIndex::new(params());
        index.insert(1, &[1.0, 0.0, 0.0]);
        index.insert(2, &[-1.0, 0.0, 0.0]);
        index.insert(3, &[0.0, 1.0, 0.0]);
        index.insert(4, &[-0.6, -0.8, 0.0]);

        let results = index.query(&[1.0, 0.0, 0.0], 4);
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].0, 1);
        assert!(results[0].1 > 0.99);
        // Opposed and orthogonal neighbors clamp to [0, 1].
        for (_, similarity) in &results[1..] {
            assert!((0.0..=1.0).contains(similarity));
        }
        assert_eq!(results[3].1, 0.0);
    }

    #[test]
    fn test_query_returns_fewer_than_k() {
        let mut index = SimilarityIndex::new(params());
        index.insert(1, &[1.0, 0.0]);
        let results = index.query(&[1.0, 0.0], 10);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_capacity_growth_preserves_contents() {
        let mut index = SimilarityIndex::with_capacity(params(), 4);
        for id in 0..20u64 {
            index.insert(id, &unit_vec(8, id + 1));
        }
        assert_eq!(index.len(), 20);

        // Every stored vector must still be findable after rebuilds.
        for id in 0..20u64 {
            let results = index.query(&unit_vec(8, id + 1), 1);
            assert_eq!(results[0].0, id, "id {} lost after growth", id);
            assert!(results[0].1 > 0.99);
        }
    }

    #[test]
    fn test_recall_at_scale() {
        let dim = 16;
        let mut index = SimilarityIndex::new(params());
        for id in 0..2000u64 {
            index.insert(id, &unit_vec(dim, id + 1));
        }

        let mut hits = 0;
        for id in (0..2000u64).step_by(97) {
            let results = index.query(&unit_vec(dim, id + 1), 1);
            if results.first().map(|r| r.0) == Some(id) {
                hits += 1;
            }
        }
        // Approximate search: expect near-perfect recall on exact queries.
        assert!(hits >= 19, "recall too low: {}/21", hits);
    }

    #[test]
    #[ignore = "timing-sensitive; run manually to confirm sub-linear query scaling"]
    fn test_query_scales_sublinearly() {
        use std::time::Instant;

        let dim = 32;
        let measure = |n: u64| {
            let mut index = SimilarityIndex::new(params());
            for id in 0..n {
                index.insert(id, &unit_vec(dim, id + 1));
            }
            let queries: Vec<_> = (0..200u64).map(|s| unit_vec(dim, s * 31 + 7)).collect();
            let start = Instant::now();
            for q in &queries {
                index.query(q, 5);
            }
            start.elapsed().as_secs_f64() / queries.len() as f64
        };

        let t_small = measure(1_000);
        let t_large = measure(10_000);
        // 10x the data must cost far less than 10x per query.
        assert!(
            t_large < t_small * 5.0,
            "query time grew linearly: {:.6}s -> {:.6}s",
            t_small,
            t_large
        );
    }

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        // Opposite vectors clamp to 0 rather than reporting -1.
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]), 0.0);
        // Mismatched lengths and zero vectors are 0.
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        // Zero vector passes through.
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
