//! Typed error taxonomy for the resolution pipeline.
//!
//! Only [`ResolutionError::EmbeddingUnavailable`] is a hard failure for a
//! user's run. Timeout and parse errors are recovered locally by the batch
//! verifier's degraded mode and surface here only for logging; any other
//! failure during one user's processing is wrapped as [`ResolutionError::PerUser`]
//! and isolated by the scheduler.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolutionError {
    /// Embedding gateway returned nothing or a count mismatch. Fatal for
    /// the batch; no partial resolution is attempted.
    #[error("embedding gateway unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Completion gateway exceeded its timeout. Recovered via the degraded
    /// accept-above-subthreshold policy.
    #[error("verification timed out after {0:?}")]
    VerificationTimeout(Duration),

    /// Verdict response could not be parsed. Same recovery as a timeout.
    #[error("verification verdict unparseable: {0}")]
    VerificationParseError(String),

    /// Any other failure while processing one user. Caught and counted by
    /// the scheduler without aborting the shard.
    #[error("resolution failed for user '{user_id}': {message}")]
    PerUser { user_id: String, message: String },
}

impl ResolutionError {
    /// Wraps an arbitrary error as a per-user failure.
    pub fn per_user(user_id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::PerUser {
            user_id: user_id.into(),
            message: err.to_string(),
        }
    }
}
