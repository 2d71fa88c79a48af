//! Static stage descriptor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::InputSchema;

/// Static description of one stage of the campaign workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// The unique stage id.
    pub id: String,
    /// Human-readable title.
    pub title: String,
    /// Constraints the submitted input must satisfy.
    pub input_schema: InputSchema,
    /// Stages whose artifacts this stage requires.
    pub depends_on: BTreeSet<String>,
    /// The kind of artifact derivation produces for this stage.
    pub artifact_kind: String,
    /// True only for the final review stage.
    pub is_terminal: bool,
}

impl Stage {
    /// Creates a new stage with no dependencies and an empty schema.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            artifact_kind: id.clone(),
            id,
            title: title.into(),
            input_schema: InputSchema::new(),
            depends_on: BTreeSet::new(),
            is_terminal: false,
        }
    }

    /// Sets the input schema.
    #[must_use]
    pub fn with_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = schema;
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.insert(dep.into());
        self
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the artifact kind.
    #[must_use]
    pub fn with_artifact_kind(mut self, kind: impl Into<String>) -> Self {
        self.artifact_kind = kind.into();
        self
    }

    /// Marks the stage as the terminal review stage.
    #[must_use]
    pub fn terminal(mut self) -> Self {
        self.is_terminal = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_builder() {
        let stage = Stage::new("creative", "Creative")
            .with_dependency("segment")
            .with_dependency("promotion")
            .with_artifact_kind("creatives");

        assert_eq!(stage.id, "creative");
        assert_eq!(stage.artifact_kind, "creatives");
        assert_eq!(stage.depends_on.len(), 2);
        assert!(!stage.is_terminal);
    }

    #[test]
    fn test_artifact_kind_defaults_to_id() {
        let stage = Stage::new("review", "Review").terminal();
        assert_eq!(stage.artifact_kind, "review");
        assert!(stage.is_terminal);
    }
}
