//! Graph storage contract and the embedded in-memory implementation.
//!
//! The resolution core only requires get/put access to a user's nodes and
//! edges plus an embedding cache keyed by (user, node). Production
//! deployments provide their own [`GraphStore`] over a real database; the
//! [`InMemoryGraphStore`] here backs tests and single-process setups.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};

use crate::types::{ConsolidationState, EntityNode, NodeId, RelationEdge};

/// Persistence contract consumed by the resolution pipeline.
///
/// `put_nodes` upserts by node id; `put_edges` replaces the user's full
/// edge set (edge rewriting during merges needs replacement semantics).
pub trait GraphStore: Send + Sync {
    /// Returns all nodes (including tombstoned ones) for a user.
    fn get_nodes(&self, user_id: &str) -> Result<Vec<EntityNode>>;

    /// Upserts nodes by id.
    fn put_nodes(&self, user_id: &str, nodes: &[EntityNode]) -> Result<()>;

    /// Returns all edges for a user.
    fn get_edges(&self, user_id: &str) -> Result<Vec<RelationEdge>>;

    /// Replaces the user's edge set.
    fn put_edges(&self, user_id: &str, edges: &[RelationEdge]) -> Result<()>;

    /// Looks up a cached embedding for (user, node).
    fn cached_embedding(&self, user_id: &str, node_id: NodeId) -> Result<Option<Vec<f32>>>;

    /// Caches an embedding so unchanged nodes are never re-embedded.
    fn cache_embedding(&self, user_id: &str, node_id: NodeId, embedding: &[f32]) -> Result<()>;

    /// Reads a user's persisted scheduling record, if any.
    fn consolidation_state(&self, user_id: &str) -> Result<Option<ConsolidationState>>;

    /// Persists a user's scheduling record, surviving worker restarts.
    fn put_consolidation_state(&self, state: &ConsolidationState) -> Result<()>;

    /// Lists all known user scopes, for shard enumeration.
    fn list_users(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
struct UserGraph {
    nodes: HashMap<NodeId, EntityNode>,
    edges: Vec<RelationEdge>,
    embeddings: HashMap<NodeId, Vec<f32>>,
    consolidation: Option<ConsolidationState>,
}

/// Embedded in-memory store with reader-writer locking.
#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    users: RwLock<HashMap<String, UserGraph>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphStore for InMemoryGraphStore {
    fn get_nodes(&self, user_id: &str) -> Result<Vec<EntityNode>> {
        let users = self
            .users
            .read()
            .map_err(|_| anyhow!("graph store lock poisoned"))?;
        Ok(users
            .get(user_id)
            .map(|g| {
                let mut nodes: Vec<_> = g.nodes.values().cloned().collect();
                nodes.sort_by_key(|n| n.id);
                nodes
            })
            .unwrap_or_default())
    }

    fn put_nodes(&self, user_id: &str, nodes: &[EntityNode]) -> Result<()> {
        let mut users = self
            .users
            .write()
            .map_err(|_| anyhow!("graph store lock poisoned"))?;
        let graph = users.entry(user_id.to_string()).or_default();
        for node in nodes {
            graph.nodes.insert(node.id, node.clone());
        }
        Ok(())
    }

    fn get_edges(&self, user_id: &str) -> Result<Vec<RelationEdge>> {
        let users = self
            .users
            .read()
            .map_err(|_| anyhow!("graph store lock poisoned"))?;
        Ok(users
            .get(user_id)
            .map(|g| g.edges.clone())
            .unwrap_or_default())
    }

    fn put_edges(&self, user_id: &str, edges: &[RelationEdge]) -> Result<()> {
        let mut users = self
            .users
            .write()
            .map_err(|_| anyhow!("graph store lock poisoned"))?;
        let graph = users.entry(user_id.to_string()).or_default();
        graph.edges = edges.to_vec();
        Ok(())
    }

    fn cached_embedding(&self, user_id: &str, node_id: NodeId) -> Result<Option<Vec<f32>>> {
        let users = self
            .users
            .read()
            .map_err(|_| anyhow!("graph store lock poisoned"))?;
        Ok(users
            .get(user_id)
            .and_then(|g| g.embeddings.get(&node_id).cloned()))
    }

    fn cache_embedding(&self, user_id: &str, node_id: NodeId, embedding: &[f32]) -> Result<()> {
        let mut users = self
            .users
            .write()
            .map_err(|_| anyhow!("graph store lock poisoned"))?;
        let graph = users.entry(user_id.to_string()).or_default();
        graph.embeddings.insert(node_id, embedding.to_vec());
        Ok(())
    }

    fn consolidation_state(&self, user_id: &str) -> Result<Option<ConsolidationState>> {
        let users = self
            .users
            .read()
            .map_err(|_| anyhow!("graph store lock poisoned"))?;
        Ok(users.get(user_id).and_then(|g| g.consolidation.clone()))
    }

    fn put_consolidation_state(&self, state: &ConsolidationState) -> Result<()> {
        let mut users = self
            .users
            .write()
            .map_err(|_| anyhow!("graph store lock poisoned"))?;
        let graph = users.entry(state.user_id.clone()).or_default();
        graph.consolidation = Some(state.clone());
        Ok(())
    }

    fn list_users(&self) -> Result<Vec<String>> {
        let users = self
            .users
            .read()
            .map_err(|_| anyhow!("graph store lock poisoned"))?;
        let mut ids: Vec<_> = users.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
