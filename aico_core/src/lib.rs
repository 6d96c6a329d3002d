//! # AICO Core
//!
//! Shared data model for the AICO entity-resolution engine.
//!
//! This crate defines:
//! - Graph types: [`types::EntityNode`], [`types::RelationEdge`], [`types::Value`]
//! - Pipeline types: [`types::CandidatePair`], [`types::Verdict`], [`types::ResolutionMetrics`]
//! - Scheduling types: [`types::ConsolidationState`], [`types::RunReport`]
//! - The resolution error taxonomy: [`error::ResolutionError`]
//! - The storage contract: [`storage::GraphStore`] plus an embedded
//!   in-memory implementation for tests and single-process deployments

pub mod error;
pub mod storage;
pub mod types;

pub use error::ResolutionError;
pub use storage::{GraphStore, InMemoryGraphStore};
pub use types::{
    unix_timestamp, CandidatePair, CandidateProvenance, ConsolidationState, EntityNode, NodeId,
    RelationEdge, ResolutionMetrics, RunReport, RunStatus, SourceRef, Value, Verdict,
    VerdictSource,
};
