//! Pipeline orchestration: embed → candidates → verify → merge → index →
//! persist, per user, with step timings collected into
//! [`ResolutionMetrics`].
//!
//! The resolver owns one similarity index per user scope and passes it
//! explicitly through the pipeline. Re-running on an already-resolved set
//! finds nothing pending and is a cheap no-op, which is what makes
//! consolidation idempotent across scheduler cycles.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use aico_config::{AicoConfig, IndexConfig, ResolutionConfig};
use aico_core::{
    EntityNode, GraphStore, NodeId, ResolutionError, ResolutionMetrics, VerdictSource,
};
use tracing::{debug, info};

use crate::candidates::CandidateGenerator;
use crate::gateway::{CompletionGateway, EmbeddingGateway};
use crate::index::SimilarityIndex;
use crate::merge::MergeResolver;
use crate::verifier::BatchVerifier;

pub struct EntityResolver {
    store: Arc<dyn GraphStore>,
    embeddings: Arc<dyn EmbeddingGateway>,
    completions: Arc<dyn CompletionGateway>,
    resolution: ResolutionConfig,
    index_params: IndexConfig,
    /// Per-user index instances. Taken out of the map for the duration of
    /// a run so the lock is never held across an await.
    indexes: Mutex<HashMap<String, SimilarityIndex>>,
}

impl EntityResolver {
    pub fn new(
        store: Arc<dyn GraphStore>,
        embeddings: Arc<dyn EmbeddingGateway>,
        completions: Arc<dyn CompletionGateway>,
        config: &AicoConfig,
    ) -> Self {
        Self {
            store,
            embeddings,
            completions,
            resolution: config.resolution.clone(),
            index_params: config.index.clone(),
            indexes: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    /// Resolves a batch of newly extracted nodes for one user, together
    /// with any backlog of stored nodes that have never been resolved.
    pub async fn resolve_user(
        &self,
        user_id: &str,
        new_nodes: Vec<EntityNode>,
    ) -> Result<ResolutionMetrics, ResolutionError> {
        let mut index = self.take_index(user_id);
        let result = self.run(user_id, new_nodes, &mut index).await;
        self.put_index(user_id, index);
        result
    }

    /// Scheduler entry point: resolve whatever is pending for the user.
    pub async fn consolidate_user(
        &self,
        user_id: &str,
    ) -> Result<ResolutionMetrics, ResolutionError> {
        self.resolve_user(user_id, Vec::new()).await
    }

    async fn run(
        &self,
        user_id: &str,
        new_nodes: Vec<EntityNode>,
        index: &mut SimilarityIndex,
    ) -> Result<ResolutionMetrics, ResolutionError> {
        let mut metrics = ResolutionMetrics::default();

        let stored = self
            .store
            .get_nodes(user_id)
            .map_err(|e| ResolutionError::per_user(user_id, e))?;
        let edges = self
            .store
            .get_edges(user_id)
            .map_err(|e| ResolutionError::per_user(user_id, e))?;

        // Rebuild index contents from cached embeddings (covers restarts).
        for node in &stored {
            if let Some(embedding) = &node.embedding {
                if !node.is_tombstoned() && !index.contains(node.id) {
                    index.insert(node.id, embedding);
                }
            }
        }

        // Pending = explicit new nodes plus stored nodes that never went
        // through a resolution pass (no embedding yet).
        let new_ids: std::collections::HashSet<NodeId> =
            new_nodes.iter().map(|n| n.id).collect();
        let mut batch = new_nodes;
        for node in &stored {
            if !node.is_tombstoned() && node.embedding.is_none() && !new_ids.contains(&node.id) {
                batch.push(node.clone());
            }
        }

        if batch.is_empty() {
            debug!(user_id, "nothing pending, consolidation is a no-op");
            return Ok(metrics);
        }
        metrics.nodes_in = batch.len();

        let existing: HashMap<NodeId, EntityNode> =
            stored.iter().map(|n| (n.id, n.clone())).collect();

        // Embed + candidate generation. Only EmbeddingUnavailable escapes
        // as a hard failure for this user's run.
        let started = Instant::now();
        let generator = CandidateGenerator::new(
            self.embeddings.as_ref(),
            self.store.as_ref(),
            &self.resolution,
        );
        let candidates = generator
            .generate(user_id, &mut batch, &existing, index)
            .await?;
        metrics.candidates_us = started.elapsed().as_micros() as u64;
        metrics.candidates_generated = candidates.len();

        // Combined node set: stored nodes, with pending batch versions
        // (now embedded) taking precedence.
        let mut combined: HashMap<NodeId, EntityNode> = existing.clone();
        for node in &batch {
            combined.insert(node.id, node.clone());
        }

        let merge_outcome = if candidates.is_empty() {
            // Nothing to verify; nodes and edges pass through untouched.
            let mut nodes: Vec<EntityNode> = combined.into_values().collect();
            nodes.sort_by_key(|n| n.id);
            crate::merge::MergeOutcome {
                nodes,
                edges,
                survivors: Vec::new(),
                groups_merged: 0,
                nodes_merged_away: 0,
            }
        } else {
            let started = Instant::now();
            let verifier = BatchVerifier::new(self.completions.as_ref(), &self.resolution);
            let verdicts = verifier.verify(&candidates, &combined).await;
            metrics.verify_us = started.elapsed().as_micros() as u64;
            metrics.pairs_verified = verdicts.len();
            metrics.degraded = verdicts
                .iter()
                .any(|v| v.source == VerdictSource::DegradedFallback);

            let started = Instant::now();
            let mut nodes: Vec<EntityNode> = combined.into_values().collect();
            nodes.sort_by_key(|n| n.id);
            let resolver = MergeResolver::new(self.resolution.max_property_variants);
            let outcome = resolver.merge(nodes, edges, &verdicts);
            metrics.merge_us = started.elapsed().as_micros() as u64;
            metrics.groups_merged = outcome.groups_merged;
            metrics.nodes_merged_away = outcome.nodes_merged_away;
            outcome
        };

        // Surviving and untouched-new nodes enter the index so future
        // passes can find them.
        let started = Instant::now();
        for node in &merge_outcome.nodes {
            if let Some(embedding) = &node.embedding {
                if !node.is_tombstoned() && index.insert(node.id, embedding) {
                    metrics.nodes_indexed += 1;
                }
            }
        }
        metrics.index_us = started.elapsed().as_micros() as u64;

        self.store
            .put_nodes(user_id, &merge_outcome.nodes)
            .map_err(|e| ResolutionError::per_user(user_id, e))?;
        self.store
            .put_edges(user_id, &merge_outcome.edges)
            .map_err(|e| ResolutionError::per_user(user_id, e))?;

        info!(
            user_id,
            nodes_in = metrics.nodes_in,
            candidates = metrics.candidates_generated,
            merged_away = metrics.nodes_merged_away,
            indexed = metrics.nodes_indexed,
            degraded = metrics.degraded,
            "resolution pass complete"
        );
        Ok(metrics)
    }

    fn take_index(&self, user_id: &str) -> SimilarityIndex {
        let mut indexes = match self.indexes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        indexes
            .remove(user_id)
            .unwrap_or_else(|| SimilarityIndex::new(self.index_params.clone()))
    }

    fn put_index(&self, user_id: &str, index: SimilarityIndex) {
        let mut indexes = match self.indexes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        indexes.insert(user_id.to_string(), index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::{
        CompletionScript, MockCompletionGateway, MockEmbeddingGateway,
    };
    use aico_core::{InMemoryGraphStore, RelationEdge};

    fn resolver_with(
        store: Arc<InMemoryGraphStore>,
        embeddings: MockEmbeddingGateway,
        script: CompletionScript,
    ) -> EntityResolver {
        let config = AicoConfig::default();
        EntityResolver::new(
            store,
            Arc::new(embeddings),
            Arc::new(MockCompletionGateway::new(script)),
            &config,
        )
    }

    fn node(id: NodeId, label: &str, text: &str, confidence: f32) -> EntityNode {
        EntityNode::new(id, "u1", label, text, confidence)
    }

    fn live_nodes(store: &InMemoryGraphStore) -> Vec<EntityNode> {
        store
            .get_nodes("u1")
            .unwrap()
            .into_iter()
            .filter(|n| !n.is_tombstoned())
            .collect()
    }

    #[tokio::test]
    async fn test_first_entity_ever() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embeddings = MockEmbeddingGateway::new(&[("PERSON: Sarah", vec![1.0, 0.0, 0.0])]);
        let resolver = resolver_with(store.clone(), embeddings, CompletionScript::ConfirmAll);

        let metrics = resolver
            .resolve_user("u1", vec![node(1, "PERSON", "Sarah", 0.9)])
            .await
            .unwrap();

        assert_eq!(metrics.candidates_generated, 0);
        assert_eq!(metrics.nodes_indexed, 1);
        let nodes = live_nodes(&store);
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].embedding.is_some());
    }

    #[tokio::test]
    async fn test_intra_batch_duplicate_merged() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embeddings = MockEmbeddingGateway::new(&[
            ("PROJECT: website redesign", vec![1.0, 0.0, 0.0]),
            ("PROJECT: redesign of the site", vec![0.97, 0.243, 0.0]),
        ]);
        let resolver = resolver_with(store.clone(), embeddings, CompletionScript::ConfirmAll);

        let metrics = resolver
            .resolve_user(
                "u1",
                vec![
                    node(1, "PROJECT", "website redesign", 0.9),
                    node(2, "PROJECT", "redesign of the site", 0.8),
                ],
            )
            .await
            .unwrap();

        assert_eq!(metrics.candidates_generated, 1);
        assert_eq!(metrics.groups_merged, 1);
        let nodes = live_nodes(&store);
        assert_eq!(nodes.len(), 1, "one concept, one live node");
        assert_eq!(nodes[0].id, 1);
    }

    #[tokio::test]
    async fn test_cross_batch_duplicate_across_runs() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embeddings = MockEmbeddingGateway::new(&[
            ("PERSON: Sarah", vec![1.0, 0.0, 0.0]),
            ("PERSON: Sarah Chen", vec![0.88, 0.475, 0.0]),
        ]);
        let resolver = resolver_with(store.clone(), embeddings, CompletionScript::ConfirmAll);

        resolver
            .resolve_user("u1", vec![node(1, "PERSON", "Sarah", 0.9)])
            .await
            .unwrap();
        let metrics = resolver
            .resolve_user("u1", vec![node(2, "PERSON", "Sarah Chen", 0.95)])
            .await
            .unwrap();

        assert_eq!(metrics.candidates_generated, 1);
        assert_eq!(metrics.nodes_merged_away, 1);
        let nodes = live_nodes(&store);
        assert_eq!(nodes.len(), 1);
        // More trusted, fuller name survives as the canonical text.
        assert_eq!(nodes[0].canonical_text, "Sarah Chen");
    }

    #[tokio::test]
    async fn test_verifier_rejection_keeps_nodes_separate() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embeddings = MockEmbeddingGateway::new(&[
            ("ORG: Apple", vec![1.0, 0.0, 0.0]),
            ("FRUIT: apple", vec![0.86, 0.5103, 0.0]),
        ]);
        let resolver = resolver_with(store.clone(), embeddings, CompletionScript::RejectAll);

        resolver
            .resolve_user("u1", vec![node(1, "ORG", "Apple", 0.9)])
            .await
            .unwrap();
        let metrics = resolver
            .resolve_user("u1", vec![node(2, "FRUIT", "apple", 0.9)])
            .await
            .unwrap();

        assert_eq!(metrics.candidates_generated, 1);
        assert_eq!(metrics.nodes_merged_away, 0);
        assert_eq!(live_nodes(&store).len(), 2);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent_noop() {
        let store = Arc::new(InMemoryGraphStore::new());
        let embeddings = MockEmbeddingGateway::new(&[
            ("PERSON: Sarah", vec![1.0, 0.0, 0.0]),
            ("PERSON: Sarah Chen", vec![0.88, 0.475, 0.0]),
        ]);
        let resolver = resolver_with(store.clone(), embeddings, CompletionScript::ConfirmAll);

        resolver
            .resolve_user(
                "u1",
                vec![
                    node(1, "PERSON", "Sarah", 0.9),
                    node(2, "PERSON", "Sarah Chen", 0.95),
                ],
            )
            .await
            .unwrap();
        let nodes_after_first = store.get_nodes("u1").unwrap();
        let edges_after_first = store.get_edges("u1").unwrap();

        let metrics = resolver.consolidate_user("u1").await.unwrap();
        assert_eq!(metrics.nodes_in, 0);
        assert_eq!(metrics.candidates_generated, 0);

        let nodes_after_second = store.get_nodes("u1").unwrap();
        assert_eq!(nodes_after_first.len(), nodes_after_second.len());
        for (a, b) in nodes_after_first.iter().zip(&nodes_after_second) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.merged_into, b.merged_into);
            assert_eq!(a.canonical_text, b.canonical_text);
        }
        assert_eq!(edges_after_first, store.get_edges("u1").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_pipeline_terminates_and_bounds_merges() {
        let store = Arc::new(InMemoryGraphStore::new());
        // Batch of three: (1,2) at 0.97 >= 0.92; (1,3) at 0.87 is a
        // candidate but sits below the degraded threshold; (2,3) at 0.72
        // is no candidate at all.
        let embeddings = MockEmbeddingGateway::new(&[
            ("PERSON: Sarah", vec![1.0, 0.0, 0.0]),
            ("PERSON: Sarah Chen", vec![0.97, 0.243, 0.0]),
            ("PERSON: Sara", vec![0.87, -0.493, 0.0]),
        ]);
        let resolver = resolver_with(store.clone(), embeddings, CompletionScript::Hang);

        let metrics = resolver
            .resolve_user(
                "u1",
                vec![
                    node(1, "PERSON", "Sarah", 0.9),
                    node(2, "PERSON", "Sarah Chen", 0.9),
                    node(3, "PERSON", "Sara", 0.9),
                ],
            )
            .await
            .unwrap();

        assert!(metrics.degraded);
        assert_eq!(metrics.nodes_merged_away, 1, "only the >=0.92 pair merges");
        let nodes = live_nodes(&store);
        assert_eq!(nodes.len(), 2);
    }

    #[tokio::test]
    async fn test_embedding_outage_is_hard_failure() {
        let store = Arc::new(InMemoryGraphStore::new());
        let mut embeddings = MockEmbeddingGateway::new(&[]);
        embeddings.fail = true;
        let resolver = resolver_with(store.clone(), embeddings, CompletionScript::ConfirmAll);

        let err = resolver
            .resolve_user("u1", vec![node(1, "PERSON", "Sarah", 0.9)])
            .await
            .unwrap_err();
        assert!(matches!(err, ResolutionError::EmbeddingUnavailable(_)));
        // No partial state was written.
        assert!(store.get_nodes("u1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_edges_rewritten_through_pipeline() {
        let store = Arc::new(InMemoryGraphStore::new());
        store
            .put_edges(
                "u1",
                &[RelationEdge {
                    source: 2,
                    target: 3,
                    label: "WORKS_ON".into(),
                    confidence: 0.8,
                    source_ref: None,
                }],
            )
            .unwrap();
        // Node 3 is a separate, already-resolved project.
        let mut project = node(3, "PROJECT", "redesign", 0.9);
        project.embedding = Some(vec![0.0, 0.0, 1.0]);
        store.put_nodes("u1", &[project]).unwrap();
        store.cache_embedding("u1", 3, &[0.0, 0.0, 1.0]).unwrap();

        let embeddings = MockEmbeddingGateway::new(&[
            ("PERSON: Sarah", vec![1.0, 0.0, 0.0]),
            ("PERSON: Sarah Chen", vec![0.93, 0.3676, 0.0]),
        ]);
        let resolver = resolver_with(store.clone(), embeddings, CompletionScript::ConfirmAll);

        resolver
            .resolve_user(
                "u1",
                vec![
                    node(1, "PERSON", "Sarah", 0.9),
                    node(2, "PERSON", "Sarah Chen", 0.8),
                ],
            )
            .await
            .unwrap();

        let edges = store.get_edges("u1").unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source, 1, "edge follows the surviving node");
        assert_eq!(edges[0].target, 3);

        let live: std::collections::HashSet<NodeId> =
            live_nodes(&store).iter().map(|n| n.id).collect();
        assert!(live.contains(&edges[0].source));
        assert!(live.contains(&edges[0].target));
    }
}
