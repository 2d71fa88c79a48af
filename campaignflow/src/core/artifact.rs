//! Derived artifact type produced by the derivation step.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::utils::{now_utc, Timestamp};

/// An artifact derived from a stage's input.
///
/// Artifacts are what a reviewer inspects before locking a stage. The
/// derivation engine produces them; the pipeline only stores them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedArtifact {
    /// A unique identifier for the artifact.
    pub id: Uuid,

    /// The stage this artifact belongs to.
    pub stage_id: String,

    /// The kind of artifact (e.g., "segments", "offer", "creative").
    pub kind: String,

    /// The artifact content.
    pub data: serde_json::Value,

    /// Additional metadata about the artifact.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Hash of the input this artifact was derived from.
    #[serde(default)]
    pub input_hash: Option<String>,

    /// When the artifact was created.
    pub created_at: Timestamp,
}

impl DerivedArtifact {
    /// Creates a new artifact.
    #[must_use]
    pub fn new(stage_id: impl Into<String>, kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage_id: stage_id.into(),
            kind: kind.into(),
            data,
            metadata: HashMap::new(),
            input_hash: None,
            created_at: now_utc(),
        }
    }

    /// Adds metadata to the artifact.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Sets the input hash.
    #[must_use]
    pub fn with_input_hash(mut self, hash: impl Into<String>) -> Self {
        self.input_hash = Some(hash.into());
        self
    }
}
