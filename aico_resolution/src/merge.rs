//! Merge resolution: collapses confirmed duplicate pairs into canonical
//! nodes via union-find transitive closure and confidence-weighted field
//! fusion, then rewrites edges so nothing dangles.

use std::collections::HashMap;

use aico_core::{EntityNode, NodeId, RelationEdge, Value, Verdict};
use tracing::debug;

/// Union-find over a dense arena of parent pointers. Path-halving find,
/// union by rank.
pub struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    pub fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Result of one merge pass.
#[derive(Debug)]
pub struct MergeOutcome {
    /// Full node set: canonical survivors, freshly tombstoned members, and
    /// untouched non-duplicates.
    pub nodes: Vec<EntityNode>,
    /// Edge set with all references to merged-away nodes rewritten.
    pub edges: Vec<RelationEdge>,
    /// Canonical node ids of the collapsed groups.
    pub survivors: Vec<NodeId>,
    pub groups_merged: usize,
    pub nodes_merged_away: usize,
}

pub struct MergeResolver {
    max_property_variants: usize,
}

impl MergeResolver {
    pub fn new(max_property_variants: usize) -> Self {
        Self {
            max_property_variants,
        }
    }

    /// Builds merge groups from confirmed verdicts and collapses each into
    /// one canonical node. Non-survivors are tombstoned, never removed.
    pub fn merge(
        &self,
        mut nodes: Vec<EntityNode>,
        edges: Vec<RelationEdge>,
        verdicts: &[Verdict],
    ) -> MergeOutcome {
        let by_id: HashMap<NodeId, usize> =
            nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();

        // Confirmed pairs whose both sides are live nodes.
        let confirmed: Vec<(NodeId, NodeId)> = verdicts
            .iter()
            .filter(|v| v.is_duplicate)
            .map(|v| (v.pair.a, v.pair.b))
            .filter(|(a, b)| {
                let live = |id: &NodeId| {
                    by_id
                        .get(id)
                        .map(|&i| !nodes[i].is_tombstoned())
                        .unwrap_or(false)
                };
                live(a) && live(b)
            })
            .collect();

        if confirmed.is_empty() {
            return MergeOutcome {
                nodes,
                edges: dedup_edges(edges),
                survivors: Vec::new(),
                groups_merged: 0,
                nodes_merged_away: 0,
            };
        }

        // Transitive closure: A≡B and B≡C places {A,B,C} in one group even
        // though A and C were never directly compared.
        let mut involved: Vec<NodeId> = confirmed
            .iter()
            .flat_map(|&(a, b)| [a, b])
            .collect();
        involved.sort_unstable();
        involved.dedup();
        let slot_of: HashMap<NodeId, usize> = involved
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();

        let mut uf = UnionFind::new(involved.len());
        for &(a, b) in &confirmed {
            uf.union(slot_of[&a], slot_of[&b]);
        }

        let mut groups: HashMap<usize, Vec<NodeId>> = HashMap::new();
        for &id in &involved {
            groups.entry(uf.find(slot_of[&id])).or_default().push(id);
        }

        let mut resolve: HashMap<NodeId, NodeId> = HashMap::new();
        let mut survivors = Vec::new();
        let mut merged_away = 0usize;
        let now = aico_core::types::unix_timestamp();

        for members in groups.values() {
            if members.len() < 2 {
                continue;
            }
            let survivor = match members.iter().min() {
                Some(&id) => id,
                None => continue,
            };
            let member_nodes: Vec<EntityNode> = members
                .iter()
                .map(|id| nodes[by_id[id]].clone())
                .collect();
            let canonical = self.fuse_group(survivor, &member_nodes, now);

            for &id in members {
                resolve.insert(id, survivor);
                let node = &mut nodes[by_id[&id]];
                if id == survivor {
                    *node = canonical.clone();
                } else {
                    node.merged_into = Some(survivor);
                    node.updated_at = now;
                    merged_away += 1;
                }
            }
            survivors.push(survivor);
        }
        survivors.sort_unstable();

        // Rewrite edges through the resolve map; drop self-loops created by
        // collapsing both endpoints into the same canonical node.
        let rewritten: Vec<RelationEdge> = edges
            .into_iter()
            .filter_map(|mut edge| {
                edge.source = *resolve.get(&edge.source).unwrap_or(&edge.source);
                edge.target = *resolve.get(&edge.target).unwrap_or(&edge.target);
                (edge.source != edge.target).then_some(edge)
            })
            .collect();

        debug!(
            groups = survivors.len(),
            merged_away, "merge resolution complete"
        );

        MergeOutcome {
            nodes,
            edges: dedup_edges(rewritten),
            groups_merged: survivors.len(),
            survivors,
            nodes_merged_away: merged_away,
        }
    }

    /// Fuses a merge group into one canonical node.
    fn fuse_group(&self, survivor: NodeId, members: &[EntityNode], now: u64) -> EntityNode {
        // Highest confidence first; id ascending for determinism on ties.
        let mut ranked: Vec<&EntityNode> = members.iter().collect();
        ranked.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });

        // Majority label, tie-broken by the highest confidence carrying it.
        let mut label_votes: HashMap<&str, (usize, f32)> = HashMap::new();
        for m in members {
            let entry = label_votes.entry(m.label.as_str()).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 = entry.1.max(m.confidence);
        }
        let label = label_votes
            .iter()
            .max_by(|a, b| {
                (a.1 .0)
                    .cmp(&b.1 .0)
                    .then(a.1 .1.partial_cmp(&b.1 .1).unwrap_or(std::cmp::Ordering::Equal))
            })
            .map(|(l, _)| l.to_string())
            .unwrap_or_default();

        // Most trusted text wins; at equal confidence prefer the more
        // complete (longer) variant, e.g. "Sarah Chen" over "Sarah".
        let canonical_text = ranked
            .iter()
            .max_by(|a, b| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.canonical_text.len().cmp(&b.canonical_text.len()))
            })
            .map(|n| n.canonical_text.clone())
            .unwrap_or_default();

        // Per-key union; conflicting values keep the highest-confidence
        // writer, losers become bounded historical variants. Variants any
        // member accumulated in earlier merges carry over, so history is
        // never reset by a later merge.
        let mut properties: HashMap<String, Value> = HashMap::new();
        let mut variants: HashMap<String, Vec<Value>> = HashMap::new();
        for m in &ranked {
            for (key, existing) in &m.property_variants {
                let list = variants.entry(key.clone()).or_default();
                for value in existing {
                    if !list.contains(value) {
                        list.push(value.clone());
                    }
                }
            }
        }
        for m in &ranked {
            for (key, value) in &m.properties {
                match properties.get(key) {
                    None => {
                        properties.insert(key.clone(), value.clone());
                    }
                    Some(winner) if winner != value => {
                        let list = variants.entry(key.clone()).or_default();
                        if !list.contains(value) {
                            list.push(value.clone());
                        }
                    }
                    Some(_) => {}
                }
            }
        }
        // Drop variants equal to the winning value, then prune oldest.
        for (key, list) in variants.iter_mut() {
            if let Some(winner) = properties.get(key) {
                list.retain(|v| v != winner);
            }
            while list.len() > self.max_property_variants {
                list.remove(0);
            }
        }
        variants.retain(|_, list| !list.is_empty());

        let confidence = members.iter().map(|m| m.confidence).fold(0.0f32, f32::max);
        let embedding = ranked.iter().find_map(|m| m.embedding.clone());

        let mut sources = Vec::new();
        for m in &ranked {
            for s in &m.sources {
                if !sources.contains(s) {
                    sources.push(s.clone());
                }
            }
        }

        EntityNode {
            id: survivor,
            user_id: ranked[0].user_id.clone(),
            label,
            canonical_text,
            properties,
            property_variants: variants,
            confidence,
            sources,
            embedding,
            created_at: members.iter().map(|m| m.created_at).min().unwrap_or(now),
            updated_at: now,
            merged_into: None,
        }
    }
}

/// Collapses duplicate (source, target, label) edges keeping the highest
/// confidence.
fn dedup_edges(edges: Vec<RelationEdge>) -> Vec<RelationEdge> {
    let mut best: HashMap<(NodeId, NodeId, String), RelationEdge> = HashMap::new();
    for edge in edges {
        let key = (edge.source, edge.target, edge.label.clone());
        match best.get(&key) {
            Some(existing) if existing.confidence >= edge.confidence => {}
            _ => {
                best.insert(key, edge);
            }
        }
    }
    let mut out: Vec<RelationEdge> = best.into_values().collect();
    out.sort_by(|a, b| (a.source, a.target, &a.label).cmp(&(b.source, b.target, &b.label)));
    out
}
