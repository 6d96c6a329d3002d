//! Candidate generation: turns a batch of newly extracted entities into a
//! deduplicated list of candidate duplicate pairs worth verifying.
//!
//! Embeddings are requested in one batched gateway call (consulting the
//! per-user cache first). Cross-batch candidates come from k-NN queries
//! against the similarity index; intra-batch candidates from pairwise
//! comparison within the batch, which is bounded by batch size (tens of
//! items), not index size.

use std::collections::HashMap;

use aico_config::ResolutionConfig;
use aico_core::{
    CandidatePair, CandidateProvenance, EntityNode, GraphStore, NodeId, ResolutionError,
};
use tracing::{debug, warn};

use crate::gateway::EmbeddingGateway;
use crate::index::{cosine_similarity, SimilarityIndex};

pub struct CandidateGenerator<'a> {
    embeddings: &'a dyn EmbeddingGateway,
    store: &'a dyn GraphStore,
    threshold: f32,
    knn_k: usize,
}

impl<'a> CandidateGenerator<'a> {
    pub fn new(
        embeddings: &'a dyn EmbeddingGateway,
        store: &'a dyn GraphStore,
        config: &ResolutionConfig,
    ) -> Self {
        Self {
            embeddings,
            store,
            threshold: config.similarity_threshold,
            knn_k: config.knn_k,
        }
    }

    /// Ensures every node in the batch carries an embedding, then produces
    /// candidate pairs from cross-batch k-NN search and intra-batch
    /// pairwise comparison.
    ///
    /// `existing` is the user's current node set, used to skip candidates
    /// whose stored counterpart is tombstoned or unknown. Fails hard with
    /// [`ResolutionError::EmbeddingUnavailable`] on any embedding problem:
    /// partial vectors would make every downstream comparison meaningless.
    pub async fn generate(
        &self,
        user_id: &str,
        batch: &mut [EntityNode],
        existing: &HashMap<NodeId, EntityNode>,
        index: &SimilarityIndex,
    ) -> Result<Vec<CandidatePair>, ResolutionError> {
        self.ensure_embeddings(user_id, batch).await?;

        let mut pairs: Vec<CandidatePair> = Vec::new();

        // Cross-batch: new nodes against previously indexed ones.
        if !index.is_empty() {
            for node in batch.iter() {
                let embedding = match &node.embedding {
                    Some(e) => e,
                    None => continue,
                };
                for (neighbor, similarity) in index.query(embedding, self.knn_k) {
                    if neighbor == node.id || similarity < self.threshold {
                        continue;
                    }
                    match existing.get(&neighbor) {
                        Some(n) if !n.is_tombstoned() => {}
                        _ => continue,
                    }
                    pairs.push(CandidatePair {
                        a: node.id,
                        b: neighbor,
                        similarity,
                        provenance: CandidateProvenance::CrossBatch,
                    });
                }
            }
        }

        // Intra-batch: catch the same entity mentioned twice in one
        // extraction pass. Pairwise, but bounded by batch size.
        for i in 0..batch.len() {
            for j in (i + 1)..batch.len() {
                let (a, b) = (&batch[i], &batch[j]);
                let (ea, eb) = match (&a.embedding, &b.embedding) {
                    (Some(ea), Some(eb)) => (ea, eb),
                    _ => continue,
                };
                let similarity = cosine_similarity(ea, eb);
                if similarity >= self.threshold {
                    pairs.push(CandidatePair {
                        a: a.id,
                        b: b.id,
                        similarity,
                        provenance: CandidateProvenance::IntraBatch,
                    });
                }
            }
        }

        pairs.sort_by_key(|p| p.key());
        pairs.dedup_by_key(|p| p.key());

        debug!(
            user_id,
            batch = batch.len(),
            candidates = pairs.len(),
            "candidate generation complete"
        );
        Ok(pairs)
    }

    /// Fills in missing embeddings from the cache, then one batched
    /// gateway call for the remainder.
    async fn ensure_embeddings(
        &self,
        user_id: &str,
        batch: &mut [EntityNode],
    ) -> Result<(), ResolutionError> {
        // Cache lookups first; a cache read failure just means re-embedding.
        for node in batch.iter_mut() {
            if node.embedding.is_some() {
                continue;
            }
            match self.store.cached_embedding(user_id, node.id) {
                Ok(Some(cached)) => node.embedding = Some(cached),
                Ok(None) => {}
                Err(e) => debug!(user_id, node = node.id, error = %e, "embedding cache read failed"),
            }
        }

        let missing: Vec<usize> = batch
            .iter()
            .enumerate()
            .filter(|(_, n)| n.embedding.is_none())
            .map(|(i, _)| i)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let texts: Vec<String> = missing
            .iter()
            .map(|&i| format!("{}: {}", batch[i].label, batch[i].canonical_text))
            .collect();

        let vectors = self
            .embeddings
            .embed_batch(&texts)
            .await
            .map_err(|e| ResolutionError::EmbeddingUnavailable(e.to_string()))?;

        if vectors.len() != missing.len() {
            return Err(ResolutionError::EmbeddingUnavailable(format!(
                "expected {} vectors, got {}",
                missing.len(),
                vectors.len()
            )));
        }

        for (&i, vector) in missing.iter().zip(vectors.into_iter()) {
            if let Err(e) = self.store.cache_embedding(user_id, batch[i].id, &vector) {
                warn!(user_id, node = batch[i].id, error = %e, "failed to cache embedding");
            }
            batch[i].embedding = Some(vector);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::MockEmbeddingGateway;
    use aico_core::InMemoryGraphStore;
    use aico_config::IndexConfig;

    fn node(id: NodeId, label: &str, text: &str) -> EntityNode {
        EntityNode::new(id, "u1", label, text, 0.9)
    }

    fn existing_map(nodes: &[EntityNode]) -> HashMap<NodeId, EntityNode> {
        nodes.iter().map(|n| (n.id, n.clone())).collect()
    }

    fn config() -> ResolutionConfig {
        ResolutionConfig::default()
    }

    #[tokio::test]
    async fn test_empty_index_yields_intra_batch_only() {
        let gateway = MockEmbeddingGateway::new(&[
            ("PROJECT: website redesign", vec![1.0, 0.0, 0.0]),
            ("PROJECT: redesign of the website", vec![0.99, 0.14, 0.0]),
        ]);
        let store = InMemoryGraphStore::new();
        let index = SimilarityIndex::new(IndexConfig::default());
        let generator = CandidateGenerator::new(&gateway, &store, &config());

        let mut batch = vec![
            node(1, "PROJECT", "website redesign"),
            node(2, "PROJECT", "redesign of the website"),
        ];
        let pairs = generator
            .generate("u1", &mut batch, &HashMap::new(), &index)
            .await
            .unwrap();

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].key(), (1, 2));
        assert_eq!(pairs[0].provenance, CandidateProvenance::IntraBatch);
        assert!(batch.iter().all(|n| n.embedding.is_some()));
    }

    #[tokio::test]
    async fn test_cross_batch_candidate_above_threshold() {
        let gateway = MockEmbeddingGateway::new(&[("PERSON: Sarah Chen", vec![0.95, 0.31, 0.0])]);
        let store = InMemoryGraphStore::new();
        let mut index = SimilarityIndex::new(IndexConfig::default());

        let mut sarah = node(1, "PERSON", "Sarah");
        sarah.embedding = Some(vec![1.0, 0.0, 0.0]);
        index.insert(1, sarah.embedding.as_ref().unwrap());

        let generator = CandidateGenerator::new(&gateway, &store, &config());
        let mut batch = vec![node(2, "PERSON", "Sarah Chen")];
        let pairs = generator
            .generate("u1", &mut batch, &existing_map(&[sarah]), &index)
            .await
            .unwrap();

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].key(), (1, 2));
        assert_eq!(pairs[0].provenance, CandidateProvenance::CrossBatch);
        assert!(pairs[0].similarity >= 0.85);
    }

    #[tokio::test]
    async fn test_below_threshold_excluded() {
        let gateway = MockEmbeddingGateway::new(&[("FRUIT: apple", vec![0.0, 1.0, 0.0])]);
        let store = InMemoryGraphStore::new();
        let mut index = SimilarityIndex::new(IndexConfig::default());

        let mut company = node(1, "ORG", "Apple Inc");
        company.embedding = Some(vec![1.0, 0.0, 0.0]);
        index.insert(1, company.embedding.as_ref().unwrap());

        let generator = CandidateGenerator::new(&gateway, &store, &config());
        let mut batch = vec![node(2, "FRUIT", "apple")];
        let pairs = generator
            .generate("u1", &mut batch, &existing_map(&[company]), &index)
            .await
            .unwrap();
        assert!(pairs.is_empty());
    }

    #[tokio::test]
    async fn test_self_match_skipped_on_rerun() {
        // Node already indexed with a cached embedding: re-running must not
        // propose the node as its own duplicate.
        let gateway = MockEmbeddingGateway::new(&[]);
        let store = InMemoryGraphStore::new();
        store.cache_embedding("u1", 1, &[1.0, 0.0, 0.0]).unwrap();

        let mut index = SimilarityIndex::new(IndexConfig::default());
        index.insert(1, &[1.0, 0.0, 0.0]);

        let sarah = node(1, "PERSON", "Sarah");
        let generator = CandidateGenerator::new(&gateway, &store, &config());
        let mut batch = vec![sarah.clone()];
        let pairs = generator
            .generate("u1", &mut batch, &existing_map(&[sarah]), &index)
            .await
            .unwrap();
        assert!(pairs.is_empty());
        // Served from cache, no gateway call.
        assert_eq!(*gateway.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_tombstoned_neighbor_skipped() {
        let gateway = MockEmbeddingGateway::new(&[("PERSON: Sarah Chen", vec![1.0, 0.0, 0.0])]);
        let store = InMemoryGraphStore::new();
        let mut index = SimilarityIndex::new(IndexConfig::default());
        index.insert(1, &[1.0, 0.0, 0.0]);

        let mut tombstoned = node(1, "PERSON", "Sarah");
        tombstoned.merged_into = Some(9);

        let generator = CandidateGenerator::new(&gateway, &store, &config());
        let mut batch = vec![node(2, "PERSON", "Sarah Chen")];
        let pairs = generator
            .generate("u1", &mut batch, &existing_map(&[tombstoned]), &index)
            .await
            .unwrap();
        assert!(pairs.is_empty());
    }

    #[tokio::test]
    async fn test_gateway_failure_is_embedding_unavailable() {
        let mut gateway = MockEmbeddingGateway::new(&[]);
        gateway.fail = true;
        let store = InMemoryGraphStore::new();
        let index = SimilarityIndex::new(IndexConfig::default());

        let generator = CandidateGenerator::new(&gateway, &store, &config());
        let mut batch = vec![node(1, "PERSON", "Sarah")];
        let err = generator
            .generate("u1", &mut batch, &HashMap::new(), &index)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::EmbeddingUnavailable(_)));
    }

    #[tokio::test]
    async fn test_count_mismatch_is_embedding_unavailable() {
        let mut gateway = MockEmbeddingGateway::new(&[
            ("PERSON: Sarah", vec![1.0, 0.0]),
            ("PERSON: Marta", vec![0.0, 1.0]),
        ]);
        gateway.short_count = true;
        let store = InMemoryGraphStore::new();
        let index = SimilarityIndex::new(IndexConfig::default());

        let generator = CandidateGenerator::new(&gateway, &store, &config());
        let mut batch = vec![node(1, "PERSON", "Sarah"), node(2, "PERSON", "Marta")];
        let err = generator
            .generate("u1", &mut batch, &HashMap::new(), &index)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::EmbeddingUnavailable(_)));
        // Hard failure: no node may keep a partial embedding assignment.
        assert!(batch.iter().all(|n| n.embedding.is_none()));
    }

    #[tokio::test]
    async fn test_duplicate_pairs_deduplicated() {
        // Two new nodes both near the same existing node and each other:
        // cross-batch yields (1,3) and (2,3); intra-batch yields (1,2).
        let gateway = MockEmbeddingGateway::new(&[
            ("PERSON: Sarah", vec![1.0, 0.0, 0.0]),
            ("PERSON: Sarah C.", vec![0.99, 0.14, 0.0]),
        ]);
        let store = InMemoryGraphStore::new();
        let mut index = SimilarityIndex::new(IndexConfig::default());
        let mut existing = node(3, "PERSON", "Sarah Chen");
        existing.embedding = Some(vec![0.98, 0.2, 0.0]);
        index.insert(3, existing.embedding.as_ref().unwrap());

        let generator = CandidateGenerator::new(&gateway, &store, &config());
        let mut batch = vec![node(1, "PERSON", "Sarah"), node(2, "PERSON", "Sarah C.")];
        let pairs = generator
            .generate("u1", &mut batch, &existing_map(&[existing]), &index)
            .await
            .unwrap();

        let mut keys: Vec<_> = pairs.iter().map(|p| p.key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), pairs.len(), "pairs must be unique");
        assert_eq!(pairs.len(), 3);
    }
}
