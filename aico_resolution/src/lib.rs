//! # AICO Resolution
//!
//! Entity-resolution and consolidation pipeline for the AICO knowledge
//! graph.
//!
//! This crate provides:
//! - **Similarity index** — incremental HNSW over entity embeddings — [`index::SimilarityIndex`]
//! - **Gateway clients** — embedding + completion capability traits with HTTP
//!   implementations — [`gateway`]
//! - **Candidate generation** — batched embedding, cross-batch k-NN and
//!   intra-batch pairwise search — [`candidates::CandidateGenerator`]
//! - **Batch verification** — single-prompt LLM confirmation with
//!   timeout-bounded degraded fallback — [`verifier::BatchVerifier`]
//! - **Merge resolution** — union-find transitive closure and
//!   confidence-weighted field fusion — [`merge::MergeResolver`]
//! - **Pipeline orchestration** — [`resolver::EntityResolver`]
//! - **Consolidation scheduling** — sharded, idle-gated, time-boxed
//!   background worker — [`scheduler::ConsolidationWorker`]
//!
//! # Test Infrastructure
//!
//! All tests are mock-based and CI-safe: scripted embedding/completion
//! gateways and the in-memory graph store stand in for the external
//! collaborators, so no network or models are required.

pub mod candidates;
pub mod gateway;
pub mod index;
pub mod merge;
pub mod resolver;
pub mod scheduler;
pub mod verifier;

pub use candidates::CandidateGenerator;
pub use gateway::{CompletionGateway, EmbeddingGateway, HttpCompletionGateway, HttpEmbeddingGateway};
pub use index::SimilarityIndex;
pub use merge::{MergeOutcome, MergeResolver};
pub use resolver::EntityResolver;
pub use scheduler::{ConsolidationWorker, LoadProbe, SchedulerPhase, SystemLoadProbe};
pub use verifier::BatchVerifier;
