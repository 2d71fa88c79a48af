//! The derivation engine seam and its request type.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use thiserror::Error;
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::core::DerivedArtifact;

/// Everything an engine needs to derive one stage's artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivationRequest {
    /// Unique id of this request.
    pub request_id: Uuid,
    /// The campaign being built.
    pub campaign_id: Uuid,
    /// The stage being derived.
    pub stage_id: String,
    /// The kind of artifact the stage produces.
    pub artifact_kind: String,
    /// The submitted stage input.
    pub input: serde_json::Value,
    /// Locked artifacts of the stage's dependencies, keyed by stage id.
    pub upstream: BTreeMap<String, DerivedArtifact>,
    /// Controller generation this request was issued for.
    pub generation: u64,
}

/// A failure reported by an engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct EngineFailure {
    /// Human-readable reason.
    pub reason: String,
    /// Whether retrying the same request might succeed.
    pub transient: bool,
}

impl EngineFailure {
    /// A failure that retrying will not fix.
    #[must_use]
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            transient: false,
        }
    }

    /// A failure worth retrying.
    #[must_use]
    pub fn transient(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            transient: true,
        }
    }
}

/// The external computation that turns stage input into an artifact.
///
/// Implementations may take a long time. They should watch `cancel` and stop
/// early once it fires; the gateway discards anything they return afterwards.
#[async_trait]
pub trait DerivationEngine: Send + Sync + Debug {
    /// Derives an artifact for the request.
    async fn derive(
        &self,
        request: &DerivationRequest,
        cancel: &CancellationToken,
    ) -> Result<DerivedArtifact, EngineFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_failure_constructors() {
        assert!(EngineFailure::transient("rate limited").transient);
        let failure = EngineFailure::permanent("bad brief");
        assert!(!failure.transient);
        assert_eq!(failure.to_string(), "bad brief");
    }
}
