//! Batch verification: asks the completion gateway to confirm or reject
//! candidate pairs in a single batched prompt, with a timeout-bounded
//! degraded fallback.
//!
//! Failure policy is deliberate: on timeout, transport failure, or an
//! unparseable verdict, the verifier accepts every pair at or above the
//! high-confidence similarity sub-threshold and rejects the rest, instead
//! of blocking or silently dropping pairs. Degraded verdicts are tagged and
//! logged loudly so operators can tell a reduced-precision run from a
//! normal one.

use std::collections::HashMap;
use std::time::Duration;

use aico_config::ResolutionConfig;
use aico_core::{CandidatePair, EntityNode, NodeId, ResolutionError, Verdict, VerdictSource};
use tracing::{debug, warn};

use crate::gateway::CompletionGateway;

const SYSTEM_PROMPT: &str = "You are an entity-resolution judge for a personal knowledge graph. \
For each numbered pair, decide whether the two entries refer to the same real-world entity. \
Output ONLY a JSON array, one object per pair, no explanation outside the JSON.";

pub struct BatchVerifier<'a> {
    completions: &'a dyn CompletionGateway,
    timeout: Duration,
    max_pairs_per_call: usize,
    degraded_threshold: f32,
}

impl<'a> BatchVerifier<'a> {
    pub fn new(completions: &'a dyn CompletionGateway, config: &ResolutionConfig) -> Self {
        Self {
            completions,
            timeout: Duration::from_secs(config.verify_timeout_secs),
            max_pairs_per_call: config.max_pairs_per_call,
            degraded_threshold: config.degraded_threshold,
        }
    }

    /// Produces one verdict per input pair. Never fails: external-dependency
    /// problems are absorbed by the degraded fallback.
    pub async fn verify(
        &self,
        pairs: &[CandidatePair],
        nodes: &HashMap<NodeId, EntityNode>,
    ) -> Vec<Verdict> {
        let mut verdicts = Vec::with_capacity(pairs.len());
        for chunk in pairs.chunks(self.max_pairs_per_call.max(1)) {
            verdicts.extend(self.verify_chunk(chunk, nodes).await);
        }
        verdicts
    }

    async fn verify_chunk(
        &self,
        chunk: &[CandidatePair],
        nodes: &HashMap<NodeId, EntityNode>,
    ) -> Vec<Verdict> {
        let prompt = build_verification_prompt(chunk, nodes);

        let output = match tokio::time::timeout(
            self.timeout,
            self.completions.complete(SYSTEM_PROMPT, &prompt),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(
                    pairs = chunk.len(),
                    error = %e,
                    "DEGRADED MODE: completion gateway failed, falling back to similarity-only verdicts"
                );
                return self.degraded_chunk(chunk);
            }
            Err(_) => {
                let err = ResolutionError::VerificationTimeout(self.timeout);
                warn!(
                    pairs = chunk.len(),
                    error = %err,
                    "DEGRADED MODE: verification timed out, falling back to similarity-only verdicts"
                );
                return self.degraded_chunk(chunk);
            }
        };

        let parsed = match parse_verdicts(&output) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(
                    pairs = chunk.len(),
                    error = %err,
                    "DEGRADED MODE: verdict response unparseable, falling back to similarity-only verdicts"
                );
                return self.degraded_chunk(chunk);
            }
        };

        let mut missing = 0usize;
        let verdicts: Vec<Verdict> = chunk
            .iter()
            .enumerate()
            .map(|(i, pair)| match parsed.get(&i) {
                Some((is_duplicate, rationale)) => Verdict {
                    pair: pair.clone(),
                    is_duplicate: *is_duplicate,
                    rationale: rationale.clone(),
                    source: VerdictSource::Llm,
                },
                None => {
                    missing += 1;
                    self.degraded_verdict(pair)
                }
            })
            .collect();

        if missing > 0 {
            warn!(
                missing,
                pairs = chunk.len(),
                "DEGRADED MODE: verdict array omitted pairs, filled from similarity-only fallback"
            );
        } else {
            debug!(pairs = chunk.len(), "verification chunk complete");
        }
        verdicts
    }

    fn degraded_chunk(&self, chunk: &[CandidatePair]) -> Vec<Verdict> {
        chunk.iter().map(|p| self.degraded_verdict(p)).collect()
    }

    /// Similarity-only policy: accept at or above the sub-threshold,
    /// reject below. Trades precision for availability.
    fn degraded_verdict(&self, pair: &CandidatePair) -> Verdict {
        let is_duplicate = pair.similarity >= self.degraded_threshold;
        Verdict {
            pair: pair.clone(),
            is_duplicate,
            rationale: format!(
                "degraded fallback: similarity {:.2} {} threshold {:.2}",
                pair.similarity,
                if is_duplicate { ">=" } else { "<" },
                self.degraded_threshold
            ),
            source: VerdictSource::DegradedFallback,
        }
    }
}

/// Renders one side of a pair with enough context for a semantic judgment.
fn render_side(id: NodeId, nodes: &HashMap<NodeId, EntityNode>) -> String {
    match nodes.get(&id) {
        Some(node) => {
            let mut out = format!("[{}] \"{}\"", node.label, node.canonical_text);
            if !node.properties.is_empty() {
                let mut keys: Vec<_> = node.properties.keys().collect();
                keys.sort();
                let props: Vec<String> = keys
                    .iter()
                    .take(4)
                    .map(|k| format!("{}={:?}", k, node.properties[*k]))
                    .collect();
                out.push_str(&format!(" {{{}}}", props.join(", ")));
            }
            if let Some(source) = node.sources.first() {
                out.push_str(&format!(" src: \"{}\"", source.snippet));
            }
            out
        }
        None => format!("[unknown] node {}", id),
    }
}

/// Builds the batched classification prompt, one numbered line per pair.
pub fn build_verification_prompt(
    pairs: &[CandidatePair],
    nodes: &HashMap<NodeId, EntityNode>,
) -> String {
    let lines: Vec<String> = pairs
        .iter()
        .enumerate()
        .map(|(i, p)| {
            format!(
                "{}. {} | {} (similarity {:.2})",
                i,
                render_side(p.a, nodes),
                render_side(p.b, nodes),
                p.similarity
            )
        })
        .collect();

    format!(
        r#"Decide for each pair below whether the two entries refer to the same real-world entity.

Pairs:
{pairs}

For each pair output:
- pair_id: the pair number
- is_duplicate: true or false
- rationale: one short sentence

Output ONLY a JSON array. Example format:
[{{"pair_id": 0, "is_duplicate": true, "rationale": "same person, fuller name"}}]

JSON output:"#,
        pairs = lines.join("\n"),
    )
}

/// Extracts a JSON array from potentially noisy LLM output: first `[` to
/// last `]`, tolerating text before or after.
fn extract_json_array(text: &str) -> &str {
    let trimmed = text.trim();
    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }
    trimmed
}

/// Parses verdict output into pair_id → (is_duplicate, rationale).
fn parse_verdicts(output: &str) -> Result<HashMap<usize, (bool, String)>, ResolutionError> {
    let json_str = extract_json_array(output);
    let parsed: Vec<serde_json::Value> = serde_json::from_str(json_str)
        .map_err(|e| ResolutionError::VerificationParseError(e.to_string()))?;

    let mut verdicts = HashMap::new();
    for item in &parsed {
        let pair_id = match item.get("pair_id").and_then(|v| v.as_u64()) {
            Some(id) => id as usize,
            None => continue,
        };
        let is_duplicate = match item.get("is_duplicate").and_then(|v| v.as_bool()) {
            Some(b) => b,
            None => continue,
        };
        let rationale = item
            .get("rationale")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        verdicts.insert(pair_id, (is_duplicate, rationale));
    }
    Ok(verdicts)
}
