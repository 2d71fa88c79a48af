//! Stage registry builder with validation.

use std::collections::HashSet;

use super::{Stage, StageRegistry};
use crate::errors::{CampaignflowError, CycleDetectedError, RegistryValidationError};

/// Builder for a [`StageRegistry`].
///
/// Stages are registered in workflow order. `build` validates the whole
/// definition at once.
#[derive(Debug, Default)]
pub struct StageRegistryBuilder {
    stages: Vec<Stage>,
}

impl StageRegistryBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates and builds the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the registry is empty, ids repeat, a dependency is
    /// missing, dependencies form a cycle, a stage depends on one registered
    /// after it, there is not exactly one terminal stage in last position, or
    /// a field pattern does not compile.
    pub fn build(mut self) -> Result<StageRegistry, CampaignflowError> {
        if self.stages.is_empty() {
            return Err(RegistryValidationError::new(
                "Stage registry must contain at least one stage",
            )
            .into());
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.id.trim().is_empty() {
                return Err(RegistryValidationError::new("Stage id cannot be empty").into());
            }
            if !seen.insert(stage.id.as_str()) {
                return Err(RegistryValidationError::new(format!(
                    "Duplicate stage id '{}'",
                    stage.id
                ))
                .with_stages(vec![stage.id.clone()])
                .into());
            }
        }

        for stage in &self.stages {
            if stage.depends_on.contains(&stage.id) {
                return Err(RegistryValidationError::new(format!(
                    "Stage '{}' cannot depend on itself",
                    stage.id
                ))
                .with_stages(vec![stage.id.clone()])
                .into());
            }
            for dep in &stage.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(RegistryValidationError::new(format!(
                        "Stage '{}' depends on unregistered stage '{dep}'",
                        stage.id
                    ))
                    .with_stages(vec![stage.id.clone(), dep.clone()])
                    .into());
                }
            }
        }

        self.detect_cycles()?;

        for (i, stage) in self.stages.iter().enumerate() {
            for dep in &stage.depends_on {
                let dep_index = self.position(dep);
                if dep_index > i {
                    return Err(RegistryValidationError::new(format!(
                        "Stage '{}' depends on '{dep}', which is registered after it",
                        stage.id
                    ))
                    .with_stages(vec![stage.id.clone(), dep.clone()])
                    .into());
                }
            }
        }

        let terminals: Vec<String> = self
            .stages
            .iter()
            .filter(|stage| stage.is_terminal)
            .map(|stage| stage.id.clone())
            .collect();
        if terminals.len() != 1 {
            return Err(RegistryValidationError::new(format!(
                "Stage registry must have exactly one terminal stage, found {}",
                terminals.len()
            ))
            .with_stages(terminals)
            .into());
        }
        let last = &self.stages[self.stages.len() - 1];
        if !last.is_terminal {
            return Err(RegistryValidationError::new(format!(
                "Terminal stage '{}' must be registered last",
                terminals[0]
            ))
            .with_stages(terminals)
            .into());
        }

        for stage in &mut self.stages {
            let id = stage.id.clone();
            stage.input_schema.compile(&id)?;
        }

        Ok(StageRegistry::from_validated(self.stages))
    }

    fn position(&self, id: &str) -> usize {
        self.stages
            .iter()
            .position(|stage| stage.id == id)
            .unwrap_or(usize::MAX)
    }

    fn stage_by_id(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.id == id)
    }

    /// Detects cycles in the dependency graph.
    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for stage in &self.stages {
            if !visited.contains(&stage.id) {
                if let Some(cycle) =
                    self.dfs_cycle(&stage.id, &mut visited, &mut rec_stack, &mut path)
                {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(stage) = self.stage_by_id(node) {
            for dep in &stage.depends_on {
                if !visited.contains(dep) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(dep) {
                    let start = path.iter().position(|n| n == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..].to_vec();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }
}
