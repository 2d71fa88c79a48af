//! Derivation engine doubles.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::core::DerivedArtifact;
use crate::gateway::{DerivationEngine, DerivationRequest, EngineFailure};

fn echo(request: &DerivationRequest) -> DerivedArtifact {
    DerivedArtifact::new(
        &request.stage_id,
        &request.artifact_kind,
        serde_json::json!({
            "input": request.input,
            "upstream": request.upstream.keys().collect::<Vec<_>>(),
        }),
    )
    .with_metadata("generation", serde_json::json!(request.generation))
}

/// An engine that answers immediately, echoing the input into the artifact.
#[derive(Debug, Default)]
pub struct EchoEngine {
    calls: Mutex<Vec<DerivationRequest>>,
}

impl EchoEngine {
    /// Creates a new echo engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of times the engine was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns the stage ids of every call, in order.
    #[must_use]
    pub fn called_stages(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|r| r.stage_id.clone())
            .collect()
    }
}

#[async_trait]
impl DerivationEngine for EchoEngine {
    async fn derive(
        &self,
        request: &DerivationRequest,
        _cancel: &CancellationToken,
    ) -> Result<DerivedArtifact, EngineFailure> {
        self.calls.lock().push(request.clone());
        Ok(echo(request))
    }
}

/// An engine that replays queued failures, then echoes.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    script: Mutex<VecDeque<EngineFailure>>,
    calls: Mutex<usize>,
}

impl ScriptedEngine {
    /// Creates an engine with an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next unscripted call.
    pub fn push_failure(&self, failure: EngineFailure) {
        self.script.lock().push_back(failure);
    }

    /// Returns the number of times the engine was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl DerivationEngine for ScriptedEngine {
    async fn derive(
        &self,
        request: &DerivationRequest,
        _cancel: &CancellationToken,
    ) -> Result<DerivedArtifact, EngineFailure> {
        *self.calls.lock() += 1;
        let next = self.script.lock().pop_front();
        match next {
            Some(failure) => Err(failure),
            None => Ok(echo(request)),
        }
    }
}

/// An engine that never answers until its request is cancelled.
///
/// Optionally stalls only some stages and echoes the rest.
#[derive(Debug, Default)]
pub struct StalledEngine {
    only: Option<HashSet<String>>,
}

impl StalledEngine {
    /// Creates an engine that stalls every stage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine that stalls only the given stages.
    #[must_use]
    pub fn for_stages(stages: &[&str]) -> Self {
        Self {
            only: Some(stages.iter().map(|s| (*s).to_string()).collect()),
        }
    }

    fn stalls(&self, stage_id: &str) -> bool {
        self.only.as_ref().map_or(true, |only| only.contains(stage_id))
    }
}

#[async_trait]
impl DerivationEngine for StalledEngine {
    async fn derive(
        &self,
        request: &DerivationRequest,
        cancel: &CancellationToken,
    ) -> Result<DerivedArtifact, EngineFailure> {
        if !self.stalls(&request.stage_id) {
            return Ok(echo(request));
        }
        cancel.cancelled().await;
        Err(EngineFailure::permanent("cancelled"))
    }
}

/// An engine that answers after a fixed delay.
#[derive(Debug)]
pub struct SlowEngine {
    delay: Duration,
}

impl SlowEngine {
    /// Creates an engine that sleeps for `delay` before echoing.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl DerivationEngine for SlowEngine {
    async fn derive(
        &self,
        request: &DerivationRequest,
        _cancel: &CancellationToken,
    ) -> Result<DerivedArtifact, EngineFailure> {
        tokio::time::sleep(self.delay).await;
        Ok(echo(request))
    }
}
