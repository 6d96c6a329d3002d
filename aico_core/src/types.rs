//! Core data types for the entity-resolution and consolidation pipeline.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Opaque, stable node identifier.
pub type NodeId = u64;

/// Current Unix timestamp in seconds.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Typed property value stored on an entity node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

/// Reference back to the source text a node or edge was extracted from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Short snippet of the originating text.
    pub snippet: String,
    /// Identifier of the originating message, if known.
    #[serde(default)]
    pub message_id: Option<String>,
}

/// A resolved real-world entity (person, place, project, ...).
///
/// Nodes are created by upstream extraction and mutated only by the merge
/// resolver. Superseded nodes are tombstoned via [`EntityNode::merged_into`],
/// never hard-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityNode {
    /// Stable identifier.
    pub id: NodeId,
    /// Owning user scope. Resolution never crosses user boundaries.
    pub user_id: String,
    /// Categorical tag, e.g. "PERSON", "PROJECT".
    pub label: String,
    /// Canonical display text for the entity.
    pub canonical_text: String,
    /// Property bag. On merge, conflicting keys keep the value from the
    /// highest-confidence group member.
    #[serde(default)]
    pub properties: HashMap<String, Value>,
    /// Historical variants of overwritten property values, newest last.
    /// Bounded per key (oldest pruned).
    #[serde(default)]
    pub property_variants: HashMap<String, Vec<Value>>,
    /// Extraction/merge confidence in [0, 1].
    pub confidence: f32,
    /// Source text spans this entity was extracted from.
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    /// Cached embedding vector. `None` until the node has been through a
    /// resolution pass.
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Creation time (Unix seconds).
    pub created_at: u64,
    /// Last mutation time (Unix seconds).
    pub updated_at: u64,
    /// Tombstone marker: the canonical node this one was merged into.
    #[serde(default)]
    pub merged_into: Option<NodeId>,
}

impl EntityNode {
    /// Creates a fresh, unresolved node.
    pub fn new(
        id: NodeId,
        user_id: impl Into<String>,
        label: impl Into<String>,
        canonical_text: impl Into<String>,
        confidence: f32,
    ) -> Self {
        let now = unix_timestamp();
        Self {
            id,
            user_id: user_id.into(),
            label: label.into(),
            canonical_text: canonical_text.into(),
            properties: HashMap::new(),
            property_variants: HashMap::new(),
            confidence: confidence.clamp(0.0, 1.0),
            sources: Vec::new(),
            embedding: None,
            created_at: now,
            updated_at: now,
            merged_into: None,
        }
    }

    /// Whether this node has been merged away into a canonical node.
    pub fn is_tombstoned(&self) -> bool {
        self.merged_into.is_some()
    }
}

/// A typed link between two entity nodes (e.g. WORKS_ON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEdge {
    /// Source node id.
    pub source: NodeId,
    /// Target node id.
    pub target: NodeId,
    /// Relation label.
    pub label: String,
    /// Extraction confidence in [0, 1].
    pub confidence: f32,
    /// Snippet of the source text, if known.
    #[serde(default)]
    pub source_ref: Option<String>,
}

/// Where a candidate pair came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateProvenance {
    /// One new node matched against a previously indexed node.
    CrossBatch,
    /// Two nodes from the same extraction batch.
    IntraBatch,
}

/// Transient record proposing two nodes as possible duplicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePair {
    pub a: NodeId,
    pub b: NodeId,
    /// Cosine similarity reported in [0, 1].
    pub similarity: f32,
    pub provenance: CandidateProvenance,
}

impl CandidatePair {
    /// Order-independent dedup key.
    pub fn key(&self) -> (NodeId, NodeId) {
        (self.a.min(self.b), self.a.max(self.b))
    }
}

/// Who produced a duplicate verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictSource {
    /// The completion gateway answered in time with parseable output.
    Llm,
    /// Timeout or parse failure; verdict came from the similarity-only
    /// fallback policy.
    DegradedFallback,
}

/// Verification outcome for one candidate pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub pair: CandidatePair,
    pub is_duplicate: bool,
    pub rationale: String,
    pub source: VerdictSource,
}

/// Per-run step timings and counts for one user's resolution pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolutionMetrics {
    /// Embedding and candidate generation duration (microseconds).
    pub candidates_us: u64,
    /// Verification duration (microseconds).
    pub verify_us: u64,
    /// Merge + edge-rewrite duration (microseconds).
    pub merge_us: u64,
    /// Index insertion duration (microseconds).
    pub index_us: u64,
    /// Nodes entering the pass.
    pub nodes_in: usize,
    /// Candidate pairs generated.
    pub candidates_generated: usize,
    /// Pairs sent through verification.
    pub pairs_verified: usize,
    /// Merge groups collapsed.
    pub groups_merged: usize,
    /// Nodes tombstoned by merging.
    pub nodes_merged_away: usize,
    /// Nodes newly inserted into the similarity index.
    pub nodes_indexed: usize,
    /// Whether any verdict came from the degraded fallback.
    pub degraded: bool,
}

/// Outcome status of a user's last consolidation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Scheduled but not yet run.
    Pending,
    Succeeded,
    Failed { error: String },
}

/// Per-user scheduling record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationState {
    pub user_id: String,
    /// Shard this user hashes into.
    pub shard: u32,
    /// Last run completion time (Unix seconds).
    pub last_run_at: Option<u64>,
    pub last_status: RunStatus,
}

/// Observability record for one scheduler run over a shard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    /// Run start (Unix seconds).
    pub started_at: u64,
    pub duration_ms: u64,
    pub users_succeeded: usize,
    pub users_failed: usize,
    /// Users skipped because the run time budget was exhausted.
    pub users_deferred: usize,
    pub entities_processed: usize,
    pub merges: usize,
    /// Whether any user's verification ran in degraded mode.
    pub degraded: bool,
}
