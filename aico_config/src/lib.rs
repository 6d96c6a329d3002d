//! # AICO Config
//!
//! Configuration system for the AICO entity-resolution engine.
//!
//! Provides TOML-based configuration parsing and validation for the
//! resolution pipeline, the consolidation scheduler, the external gateway
//! endpoints, and the similarity index.
//!
//! # Configuration Schema
//!
//! The configuration file (`aico.toml`) supports the following sections:
//! - `[resolution]` — similarity thresholds, k-NN fanout, verification limits
//! - `[scheduler]` — trigger cadence, sharding, time budget, load gating
//! - `[embedding]` — embedding gateway endpoint and model
//! - `[completion]` — completion gateway endpoint and model
//! - `[index]` — HNSW index parameters
//!
//! # Environment Variable Overrides
//!
//! Fields can be overridden via environment variables using the `AICO_`
//! prefix and `_` as section separator:
//! - `AICO_RESOLUTION_SIMILARITY_THRESHOLD` → `resolution.similarity_threshold`
//! - `AICO_RESOLUTION_DEGRADED_THRESHOLD` → `resolution.degraded_threshold`
//! - `AICO_RESOLUTION_VERIFY_TIMEOUT_SECS` → `resolution.verify_timeout_secs`
//! - `AICO_SCHEDULER_TRIGGER_INTERVAL_SECS` → `scheduler.trigger_interval_secs`
//! - `AICO_SCHEDULER_SHARD_COUNT` → `scheduler.shard_count`
//! - `AICO_EMBEDDING_ENDPOINT` → `embedding.endpoint`
//! - `AICO_COMPLETION_ENDPOINT` → `completion.endpoint`
//! - etc.

use serde::{Deserialize, Serialize};

/// Top-level AICO configuration.
///
/// Parsed from `aico.toml` or constructed programmatically. Environment
/// variables with the `AICO_` prefix override TOML values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AicoConfig {
    /// Resolution pipeline settings.
    #[serde(default)]
    pub resolution: ResolutionConfig,
    /// Consolidation scheduler settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Embedding gateway settings.
    #[serde(default)]
    pub embedding: EmbeddingGatewayConfig,
    /// Completion gateway settings.
    #[serde(default)]
    pub completion: CompletionGatewayConfig,
    /// Similarity index settings.
    #[serde(default)]
    pub index: IndexConfig,
}

/// Resolution pipeline thresholds and limits.
///
/// The numeric defaults (0.85 threshold, 0.92 degraded sub-threshold, 30s
/// timeout) were arrived at empirically and are expected to be tuned per
/// deployment, which is why they live in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionConfig {
    /// Minimum cosine similarity for a pair to become a candidate (default: 0.85).
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Similarity at or above which degraded mode accepts a pair as
    /// duplicate without LLM confirmation (default: 0.92).
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: f32,
    /// Nearest neighbors fetched per new node during cross-batch search (default: 5).
    #[serde(default = "default_knn_k")]
    pub knn_k: usize,
    /// Maximum candidate pairs per completion gateway call (default: 100).
    #[serde(default = "default_max_pairs_per_call")]
    pub max_pairs_per_call: usize,
    /// Timeout for one completion gateway call in seconds (default: 30).
    #[serde(default = "default_verify_timeout_secs")]
    pub verify_timeout_secs: u64,
    /// Historical property variants retained per key (default: 3).
    #[serde(default = "default_max_property_variants")]
    pub max_property_variants: usize,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            degraded_threshold: default_degraded_threshold(),
            knn_k: default_knn_k(),
            max_pairs_per_call: default_max_pairs_per_call(),
            verify_timeout_secs: default_verify_timeout_secs(),
            max_property_variants: default_max_property_variants(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.85
}
fn default_degraded_threshold() -> f32 {
    0.92
}
fn default_knn_k() -> usize {
    5
}
fn default_max_pairs_per_call() -> usize {
    100
}
fn default_verify_timeout_secs() -> u64 {
    30
}
fn default_max_property_variants() -> usize {
    3
}

/// Background consolidation scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enable the background worker (default: true).
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    /// Seconds between periodic triggers (default: 900).
    #[serde(default = "default_trigger_interval")]
    pub trigger_interval_secs: u64,
    /// Number of user shards; one shard is processed per day-slot (default: 4).
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Wall-clock budget for one run in seconds (default: 3600).
    #[serde(default = "default_run_time_budget")]
    pub run_time_budget_secs: u64,
    /// Maximum 1-minute load average per core before a run is allowed to
    /// start (default: 0.5). Consolidation is background maintenance and
    /// must never compete with interactive traffic.
    #[serde(default = "default_max_load_per_core")]
    pub max_load_per_core: f32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            trigger_interval_secs: default_trigger_interval(),
            shard_count: default_shard_count(),
            run_time_budget_secs: default_run_time_budget(),
            max_load_per_core: default_max_load_per_core(),
        }
    }
}

fn default_scheduler_enabled() -> bool {
    true
}
fn default_trigger_interval() -> u64 {
    900
}
fn default_shard_count() -> u32 {
    4
}
fn default_run_time_budget() -> u64 {
    3600
}
fn default_max_load_per_core() -> f32 {
    0.5
}

/// Embedding gateway (text → vector) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingGatewayConfig {
    /// OpenAI-compatible base URL (default: "http://localhost:8080/v1").
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,
    /// Model identifier sent with each request.
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Environment variable holding the API key, if the gateway needs one.
    #[serde(default = "default_embedding_api_key_env")]
    pub api_key_env: String,
    /// Expected vector dimension (default: 384).
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
}

impl Default for EmbeddingGatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: default_embedding_endpoint(),
            model: default_embedding_model(),
            api_key_env: default_embedding_api_key_env(),
            dimension: default_embedding_dimension(),
        }
    }
}

fn default_embedding_endpoint() -> String {
    "http://localhost:8080/v1".to_string()
}
fn default_embedding_model() -> String {
    "all-MiniLM-L6-v2".to_string()
}
fn default_embedding_api_key_env() -> String {
    "AICO_EMBEDDING_API_KEY".to_string()
}
fn default_embedding_dimension() -> usize {
    384
}

/// Completion gateway (batch classification) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionGatewayConfig {
    /// OpenAI-compatible base URL (default: "https://api.openai.com/v1").
    #[serde(default = "default_completion_endpoint")]
    pub endpoint: String,
    /// Model identifier sent with each request.
    #[serde(default = "default_completion_model")]
    pub model: String,
    /// Environment variable holding the API key.
    #[serde(default = "default_completion_api_key_env")]
    pub api_key_env: String,
    /// Maximum tokens for the verdict completion (default: 1024).
    #[serde(default = "default_completion_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature (default: 0.0 — verdicts should be deterministic).
    #[serde(default)]
    pub temperature: f32,
}

impl Default for CompletionGatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: default_completion_endpoint(),
            model: default_completion_model(),
            api_key_env: default_completion_api_key_env(),
            max_tokens: default_completion_max_tokens(),
            temperature: 0.0,
        }
    }
}

fn default_completion_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_completion_api_key_env() -> String {
    "AICO_COMPLETION_API_KEY".to_string()
}
fn default_completion_max_tokens() -> u32 {
    1024
}

/// HNSW similarity index parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Max bi-directional links per layer (default: 16).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Construction search width (default: 200). Higher improves recall at
    /// the cost of build time.
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    /// Query search width (default: 64).
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
        }
    }
}

fn default_max_connections() -> usize {
    16
}
fn default_ef_construction() -> usize {
    200
}
fn default_ef_search() -> usize {
    64
}

impl AicoConfig {
    /// Loads configuration from a TOML file, then applies environment
    /// variable overrides and validates.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        Self::parse_toml(&contents)
    }

    /// Parses configuration from a TOML string, applies env overrides,
    /// then validates.
    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        let mut config: AicoConfig = toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML config: {}", e))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        // Resolution overrides
        if let Ok(v) = std::env::var("AICO_RESOLUTION_SIMILARITY_THRESHOLD") {
            if let Ok(t) = v.parse::<f32>() {
                self.resolution.similarity_threshold = t;
            }
        }
        if let Ok(v) = std::env::var("AICO_RESOLUTION_DEGRADED_THRESHOLD") {
            if let Ok(t) = v.parse::<f32>() {
                self.resolution.degraded_threshold = t;
            }
        }
        if let Ok(v) = std::env::var("AICO_RESOLUTION_KNN_K") {
            if let Ok(k) = v.parse::<usize>() {
                self.resolution.knn_k = k;
            }
        }
        if let Ok(v) = std::env::var("AICO_RESOLUTION_MAX_PAIRS_PER_CALL") {
            if let Ok(m) = v.parse::<usize>() {
                self.resolution.max_pairs_per_call = m;
            }
        }
        if let Ok(v) = std::env::var("AICO_RESOLUTION_VERIFY_TIMEOUT_SECS") {
            if let Ok(t) = v.parse::<u64>() {
                self.resolution.verify_timeout_secs = t;
            }
        }
        if let Ok(v) = std::env::var("AICO_RESOLUTION_MAX_PROPERTY_VARIANTS") {
            if let Ok(m) = v.parse::<usize>() {
                self.resolution.max_property_variants = m;
            }
        }

        // Scheduler overrides
        if let Ok(v) = std::env::var("AICO_SCHEDULER_ENABLED") {
            if let Ok(b) = v.parse::<bool>() {
                self.scheduler.enabled = b;
            }
        }
        if let Ok(v) = std::env::var("AICO_SCHEDULER_TRIGGER_INTERVAL_SECS") {
            if let Ok(t) = v.parse::<u64>() {
                self.scheduler.trigger_interval_secs = t;
            }
        }
        if let Ok(v) = std::env::var("AICO_SCHEDULER_SHARD_COUNT") {
            if let Ok(s) = v.parse::<u32>() {
                self.scheduler.shard_count = s;
            }
        }
        if let Ok(v) = std::env::var("AICO_SCHEDULER_RUN_TIME_BUDGET_SECS") {
            if let Ok(t) = v.parse::<u64>() {
                self.scheduler.run_time_budget_secs = t;
            }
        }
        if let Ok(v) = std::env::var("AICO_SCHEDULER_MAX_LOAD_PER_CORE") {
            if let Ok(l) = v.parse::<f32>() {
                self.scheduler.max_load_per_core = l;
            }
        }

        // Gateway overrides
        if let Ok(v) = std::env::var("AICO_EMBEDDING_ENDPOINT") {
            self.embedding.endpoint = v;
        }
        if let Ok(v) = std::env::var("AICO_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("AICO_EMBEDDING_DIMENSION") {
            if let Ok(d) = v.parse::<usize>() {
                self.embedding.dimension = d;
            }
        }
        if let Ok(v) = std::env::var("AICO_COMPLETION_ENDPOINT") {
            self.completion.endpoint = v;
        }
        if let Ok(v) = std::env::var("AICO_COMPLETION_MODEL") {
            self.completion.model = v;
        }
        if let Ok(v) = std::env::var("AICO_COMPLETION_MAX_TOKENS") {
            if let Ok(m) = v.parse::<u32>() {
                self.completion.max_tokens = m;
            }
        }

        // Index overrides
        if let Ok(v) = std::env::var("AICO_INDEX_MAX_CONNECTIONS") {
            if let Ok(m) = v.parse::<usize>() {
                self.index.max_connections = m;
            }
        }
        if let Ok(v) = std::env::var("AICO_INDEX_EF_CONSTRUCTION") {
            if let Ok(e) = v.parse::<usize>() {
                self.index.ef_construction = e;
            }
        }
        if let Ok(v) = std::env::var("AICO_INDEX_EF_SEARCH") {
            if let Ok(e) = v.parse::<usize>() {
                self.index.ef_search = e;
            }
        }
    }

    /// Validates the configuration, returning an error describing the first
    /// problem found.
    pub fn validate(&self) -> anyhow::Result<()> {
        let r = &self.resolution;
        if !(r.similarity_threshold > 0.0 && r.similarity_threshold <= 1.0) {
            anyhow::bail!(
                "resolution.similarity_threshold must be in (0, 1], got {}",
                r.similarity_threshold
            );
        }
        if !(r.degraded_threshold > 0.0 && r.degraded_threshold <= 1.0) {
            anyhow::bail!(
                "resolution.degraded_threshold must be in (0, 1], got {}",
                r.degraded_threshold
            );
        }
        if r.degraded_threshold < r.similarity_threshold {
            anyhow::bail!(
                "resolution.degraded_threshold ({}) must not be below resolution.similarity_threshold ({})",
                r.degraded_threshold,
                r.similarity_threshold
            );
        }
        if r.knn_k == 0 {
            anyhow::bail!("resolution.knn_k must be at least 1");
        }
        if r.max_pairs_per_call == 0 {
            anyhow::bail!("resolution.max_pairs_per_call must be at least 1");
        }
        if r.verify_timeout_secs == 0 {
            anyhow::bail!("resolution.verify_timeout_secs must be at least 1");
        }
        if self.scheduler.shard_count == 0 {
            anyhow::bail!("scheduler.shard_count must be at least 1");
        }
        if self.scheduler.trigger_interval_secs == 0 {
            anyhow::bail!("scheduler.trigger_interval_secs must be at least 1");
        }
        if self.embedding.dimension == 0 {
            anyhow::bail!("embedding.dimension must be at least 1");
        }
        if self.index.max_connections == 0
            || self.index.ef_construction == 0
            || self.index.ef_search == 0
        {
            anyhow::bail!(
                "index.max_connections, index.ef_construction and index.ef_search must be at least 1"
            );
        }
        Ok(())
    }
}
