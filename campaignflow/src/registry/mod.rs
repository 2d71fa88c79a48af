//! The stage registry: ordered, validated stage definitions.
//!
//! The registry is the single source of truth for stage ordering and
//! dependencies. It is built once, shared as `Arc<StageRegistry>` and never
//! mutated, so concurrent readers need no synchronization.

mod builder;
mod presets;
mod schema;
mod stage;

pub use builder::StageRegistryBuilder;
pub use presets::CAMPAIGN_STAGES;
pub use schema::{FieldKind, FieldSpec, InputSchema};
pub use stage::Stage;

use std::collections::{BTreeSet, HashMap};

use crate::errors::UnknownStageError;

/// Ordered, immutable set of stages.
#[derive(Debug, Clone)]
pub struct StageRegistry {
    stages: Vec<Stage>,
    index: HashMap<String, usize>,
    /// Transitive dependents of each stage, in registry order.
    dependents: HashMap<String, Vec<String>>,
}

impl StageRegistry {
    /// Creates a registry builder.
    #[must_use]
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder::new()
    }

    /// Assembles a registry from stages that were already validated.
    pub(crate) fn from_validated(stages: Vec<Stage>) -> Self {
        let index: HashMap<String, usize> = stages
            .iter()
            .enumerate()
            .map(|(i, stage)| (stage.id.clone(), i))
            .collect();

        // Dependencies always point backwards, so a single pass from the end
        // sees every dependent's own closure before it is needed.
        let mut closures: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); stages.len()];
        for i in (0..stages.len()).rev() {
            let mut closure = BTreeSet::new();
            for (j, candidate) in stages.iter().enumerate().skip(i + 1) {
                if candidate.depends_on.contains(&stages[i].id) {
                    closure.insert(j);
                    closure.extend(closures[j].iter().copied());
                }
            }
            closures[i] = closure;
        }

        let dependents = stages
            .iter()
            .zip(closures)
            .map(|(stage, closure)| {
                let ids = closure.into_iter().map(|j| stages[j].id.clone()).collect();
                (stage.id.clone(), ids)
            })
            .collect();

        Self {
            stages,
            index,
            dependents,
        }
    }

    /// Returns all stages in order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the registry has no stages. A built registry never is.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns the stage at a position.
    #[must_use]
    pub fn stage_at(&self, index: usize) -> Option<&Stage> {
        self.stages.get(index)
    }

    /// Returns true if the stage id is registered.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Looks up a stage by id.
    pub fn stage(&self, id: &str) -> Result<&Stage, UnknownStageError> {
        self.index_of(id).map(|i| &self.stages[i])
    }

    /// Returns the position of a stage.
    pub fn index_of(&self, id: &str) -> Result<usize, UnknownStageError> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| UnknownStageError::new(id))
    }

    /// Returns the stage after `id`, or `None` if `id` is terminal.
    pub fn next_stage(&self, id: &str) -> Result<Option<&Stage>, UnknownStageError> {
        let i = self.index_of(id)?;
        if self.stages[i].is_terminal {
            return Ok(None);
        }
        Ok(self.stages.get(i + 1))
    }

    /// Returns the direct dependencies of a stage.
    pub fn dependencies_of(&self, id: &str) -> Result<&BTreeSet<String>, UnknownStageError> {
        self.stage(id).map(|stage| &stage.depends_on)
    }

    /// Returns every stage that transitively depends on `id`, in registry order.
    pub fn dependents_of(&self, id: &str) -> Result<&[String], UnknownStageError> {
        self.dependents
            .get(id)
            .map(Vec::as_slice)
            .ok_or_else(|| UnknownStageError::new(id))
    }

    /// Returns the terminal stage.
    #[must_use]
    pub fn terminal(&self) -> &Stage {
        // Builder validation guarantees the last stage is the terminal one.
        &self.stages[self.stages.len() - 1]
    }

    /// Returns the stage ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|stage| stage.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn diamond() -> StageRegistry {
        StageRegistry::builder()
            .stage(Stage::new("a", "A"))
            .stage(Stage::new("b", "B").with_dependency("a"))
            .stage(Stage::new("c", "C").with_dependency("a"))
            .stage(Stage::new("d", "D").with_dependencies(["b", "c"]))
            .stage(Stage::new("e", "E").with_dependency("c").terminal())
            .build()
            .unwrap()
    }

    #[test]
    fn test_lookup() {
        let registry = diamond();
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.stage_at(0).unwrap().id, "a");
        assert_eq!(registry.index_of("d").unwrap(), 3);
        assert!(registry.contains("e"));
        assert!(!registry.contains("z"));
    }

    #[test]
    fn test_unknown_stage() {
        let registry = diamond();
        assert_eq!(registry.stage("z").unwrap_err(), UnknownStageError::new("z"));
        assert!(registry.dependencies_of("z").is_err());
        assert!(registry.dependents_of("z").is_err());
        assert!(registry.next_stage("z").is_err());
    }

    #[test]
    fn test_next_stage() {
        let registry = diamond();
        assert_eq!(registry.next_stage("a").unwrap().unwrap().id, "b");
        assert!(registry.next_stage("e").unwrap().is_none());
    }

    #[test]
    fn test_dependencies_of() {
        let registry = diamond();
        let deps: Vec<_> = registry.dependencies_of("d").unwrap().iter().cloned().collect();
        assert_eq!(deps, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_transitive_dependents_in_order() {
        let registry = diamond();
        assert_eq!(registry.dependents_of("a").unwrap(), ["b", "c", "d", "e"]);
        assert_eq!(registry.dependents_of("b").unwrap(), ["d"]);
        assert_eq!(registry.dependents_of("c").unwrap(), ["d", "e"]);
        assert!(registry.dependents_of("e").unwrap().is_empty());
    }

    #[test]
    fn test_terminal() {
        assert_eq!(diamond().terminal().id, "e");
    }
}
