//! The per-campaign stage state machine.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::core::{DerivedArtifact, StageRecord, StageStatus};
use crate::errors::{
    CampaignflowError, DerivationError, PreconditionError, UnknownStageError,
};
use crate::events::{names, EventSink, PipelineEvent};
use crate::gateway::DerivationRequest;
use crate::registry::{Stage, StageRegistry};
use crate::utils::generate_request_id;

/// A derivation issued by [`PipelineController::start_derive`].
///
/// Hand the request to the gateway and the result back to
/// [`PipelineController::complete_derive`] together with this ticket.
#[derive(Debug, Clone)]
pub struct DerivationTicket {
    /// The request to send to the gateway.
    pub request: DerivationRequest,
    /// When the stage times out.
    pub deadline: Instant,
    /// The configured derivation timeout.
    pub timeout: Duration,
}

impl DerivationTicket {
    /// Returns the stage being derived.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        &self.request.stage_id
    }

    /// Returns the timeout in milliseconds.
    #[must_use]
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// What happened to a derivation result.
#[derive(Debug, Clone, PartialEq)]
pub enum DeriveOutcome {
    /// The artifact was stored and the stage is awaiting review.
    Applied(DerivedArtifact),
    /// The derivation failed and the stage is back to `InputCaptured`.
    Failed(DerivationError),
    /// The result was stale and dropped without touching the stage.
    Discarded(String),
}

/// Result of unlocking a stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnlockReport {
    /// Downstream stages reset to `NotStarted`, in registry order.
    pub invalidated: Vec<String>,
    /// Gateway requests of invalidated stages that were still deriving.
    pub cancelled_requests: Vec<Uuid>,
}

/// Read-only view of one stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageView {
    /// The stage id.
    pub stage_id: String,
    /// The stage title.
    pub title: String,
    /// Current status.
    pub status: StageStatus,
    /// The record, if the stage was ever touched.
    pub record: Option<StageRecord>,
}

/// Drives one campaign's stages through their lifecycle.
///
/// Every transition checks its guard first, then writes the audit log, then
/// mutates. A failed guard or audit write leaves the records untouched.
/// Transitions are synchronous; the only waiting happens in the gateway,
/// between [`start_derive`](Self::start_derive) and
/// [`complete_derive`](Self::complete_derive).
#[derive(Debug)]
pub struct PipelineController {
    campaign_id: Uuid,
    registry: Arc<StageRegistry>,
    pub(super) records: HashMap<String, StageRecord>,
    pub(super) audit: Arc<dyn AuditLog>,
    pub(super) events: Arc<dyn EventSink>,
    derive_timeout: Duration,
}

impl PipelineController {
    /// Creates a controller with no stage records.
    #[must_use]
    pub fn new(
        campaign_id: Uuid,
        registry: Arc<StageRegistry>,
        audit: Arc<dyn AuditLog>,
        events: Arc<dyn EventSink>,
        derive_timeout: Duration,
    ) -> Self {
        Self {
            campaign_id,
            registry,
            records: HashMap::new(),
            audit,
            events,
            derive_timeout,
        }
    }

    /// Returns the campaign id.
    #[must_use]
    pub fn campaign_id(&self) -> Uuid {
        self.campaign_id
    }

    /// Returns the stage registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<StageRegistry> {
        &self.registry
    }

    /// Returns the derivation timeout.
    #[must_use]
    pub fn derive_timeout(&self) -> Duration {
        self.derive_timeout
    }

    // ------------------------------------------------------------------
    // Read models
    // ------------------------------------------------------------------

    /// Returns a stage's status. Untouched stages read as `NotStarted`.
    pub fn status(&self, stage_id: &str) -> Result<StageStatus, UnknownStageError> {
        Ok(self.record(stage_id)?.map_or(StageStatus::NotStarted, |r| r.status))
    }

    /// Returns a stage's record, if it was ever touched.
    pub fn record(&self, stage_id: &str) -> Result<Option<&StageRecord>, UnknownStageError> {
        self.registry.stage(stage_id)?;
        Ok(self.records.get(stage_id))
    }

    /// Iterates stages in registry order with their records.
    pub fn records(&self) -> impl Iterator<Item = (&Stage, Option<&StageRecord>)> {
        self.registry
            .stages()
            .iter()
            .map(|stage| (stage, self.records.get(&stage.id)))
    }

    /// Returns an owned view of every stage in registry order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StageView> {
        self.records()
            .map(|(stage, record)| StageView {
                stage_id: stage.id.clone(),
                title: stage.title.clone(),
                status: record.map_or(StageStatus::NotStarted, |r| r.status),
                record: record.cloned(),
            })
            .collect()
    }

    /// Returns the first stage in registry order that is not locked.
    ///
    /// `None` means every stage, the terminal one included, is locked.
    #[must_use]
    pub fn current_stage(&self) -> Option<&Stage> {
        self.registry
            .stages()
            .iter()
            .find(|stage| !self.status_of(&stage.id).is_locked())
    }

    /// Returns the id of [`current_stage`](Self::current_stage).
    #[must_use]
    pub fn current_stage_id(&self) -> Option<&str> {
        self.current_stage().map(|stage| stage.id.as_str())
    }

    /// Returns true once the terminal stage is locked.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status_of(&self.registry.terminal().id).is_locked()
    }

    /// Returns the dependencies of `stage_id` that are not locked.
    pub fn pending_dependencies(&self, stage_id: &str) -> Result<Vec<String>, UnknownStageError> {
        Ok(self
            .registry
            .dependencies_of(stage_id)?
            .iter()
            .filter(|dep| !self.status_of(dep).is_locked())
            .cloned()
            .collect())
    }

    /// Returns the deadline of the earliest in-flight derivation.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.records.values().filter_map(StageRecord::deadline).min()
    }

    // ------------------------------------------------------------------
    // Input and derivation
    // ------------------------------------------------------------------

    /// Captures input for a stage.
    ///
    /// Returns the request id of a derivation that this submission superseded.
    ///
    /// # Errors
    ///
    /// - `PreconditionError` if the stage is awaiting review or locked
    /// - `InputValidationError` if the input violates the stage schema
    pub fn submit_input(
        &mut self,
        stage_id: &str,
        input: serde_json::Value,
    ) -> Result<Option<Uuid>, CampaignflowError> {
        let stage = self.registry.stage(stage_id)?;
        let status = self.status_of(stage_id);
        match status {
            StageStatus::PendingReview => {
                return Err(PreconditionError::new(
                    stage_id,
                    "submit input to",
                    status,
                    "request an edit before changing the input",
                )
                .into());
            }
            StageStatus::Locked => {
                return Err(PreconditionError::new(
                    stage_id,
                    "submit input to",
                    status,
                    "unlock the stage before changing the input",
                )
                .into());
            }
            StageStatus::NotStarted | StageStatus::InputCaptured | StageStatus::Deriving => {}
        }
        stage.input_schema.validate(stage_id, &input)?;

        let mut superseded = None;
        match self.records.get_mut(stage_id) {
            Some(record) => {
                if record.status == StageStatus::Deriving {
                    superseded = record.request_id;
                    // Late results for the superseded request must not match.
                    record.generation += 1;
                }
                record.input = Some(input);
                record.return_to_input(None);
            }
            None => {
                self.records
                    .insert(stage_id.to_string(), StageRecord::captured(input));
            }
        }

        debug!(
            campaign_id = %self.campaign_id,
            stage_id,
            superseded = ?superseded,
            "Input captured"
        );
        self.emit(
            PipelineEvent::for_stage(names::INPUT_CAPTURED, self.campaign_id, stage_id)
                .with_data(serde_json::json!({ "superseded": superseded })),
        );
        Ok(superseded)
    }

    /// Moves a stage to `Deriving` and issues a derivation request.
    ///
    /// # Errors
    ///
    /// `PreconditionError` unless the stage has captured input and every
    /// dependency is locked.
    pub fn start_derive(&mut self, stage_id: &str) -> Result<DerivationTicket, CampaignflowError> {
        let stage = self.registry.stage(stage_id)?;
        let status = self.status_of(stage_id);
        if status != StageStatus::InputCaptured {
            let message = match status {
                StageStatus::NotStarted => "no input has been captured",
                StageStatus::Deriving => "a derivation is already in flight",
                _ => "the stage already has an artifact",
            };
            return Err(PreconditionError::new(stage_id, "derive", status, message).into());
        }

        let pending = self.pending_dependencies(stage_id)?;
        if !pending.is_empty() {
            return Err(
                PreconditionError::dependencies_not_locked(stage_id, "derive", status, &pending)
                    .into(),
            );
        }

        let upstream: BTreeMap<String, DerivedArtifact> = stage
            .depends_on
            .iter()
            .filter_map(|dep| {
                self.records
                    .get(dep)
                    .and_then(|r| r.artifact.clone())
                    .map(|a| (dep.clone(), a))
            })
            .collect();
        let artifact_kind = stage.artifact_kind.clone();

        let Some(record) = self.records.get_mut(stage_id) else {
            return Err(PreconditionError::new(
                stage_id,
                "derive",
                status,
                "no input has been captured",
            )
            .into());
        };

        let request_id = generate_request_id();
        let deadline = Instant::now() + self.derive_timeout;
        record.generation += 1;
        record.status = StageStatus::Deriving;
        record.request_id = Some(request_id);
        record.deadline = Some(deadline);
        record.last_error = None;
        record.touch();

        let request = DerivationRequest {
            request_id,
            campaign_id: self.campaign_id,
            stage_id: stage_id.to_string(),
            artifact_kind,
            input: record.input.clone().unwrap_or(serde_json::Value::Null),
            upstream,
            generation: record.generation,
        };

        info!(
            campaign_id = %self.campaign_id,
            stage_id,
            generation = request.generation,
            %request_id,
            "Derivation started"
        );
        self.emit(
            PipelineEvent::for_stage(names::DERIVE_STARTED, self.campaign_id, stage_id)
                .with_data(serde_json::json!({
                    "request_id": request_id,
                    "generation": request.generation,
                })),
        );

        Ok(DerivationTicket {
            request,
            deadline,
            timeout: self.derive_timeout,
        })
    }

    /// Applies a derivation result.
    ///
    /// Results for a request that is no longer current (superseded,
    /// cancelled, invalidated, or already expired) are discarded without
    /// touching the stage. A success that arrives after the deadline is
    /// treated as a timeout.
    pub fn complete_derive(
        &mut self,
        ticket: &DerivationTicket,
        result: Result<DerivedArtifact, DerivationError>,
    ) -> Result<DeriveOutcome, UnknownStageError> {
        let stage_id = ticket.stage_id();
        self.registry.stage(stage_id)?;
        let campaign_id = self.campaign_id;

        let Some(record) = self.records.get_mut(stage_id) else {
            return Ok(self.discard(stage_id, "stage was reset"));
        };
        if record.status != StageStatus::Deriving
            || record.generation != ticket.request.generation
            || record.request_id != Some(ticket.request.request_id)
        {
            let reason = format!(
                "result for generation {} is stale (stage is {} at generation {})",
                ticket.request.generation, record.status, record.generation
            );
            return Ok(self.discard(stage_id, &reason));
        }

        let result = match result {
            Ok(_) if record.is_overdue(Instant::now()) => {
                Err(DerivationError::timeout(stage_id, ticket.timeout_ms()))
            }
            other => other,
        };

        match result {
            Ok(artifact) => {
                record.status = StageStatus::PendingReview;
                record.artifact = Some(artifact.clone());
                record.request_id = None;
                record.deadline = None;
                record.last_error = None;
                record.touch();

                info!(
                    %campaign_id,
                    stage_id,
                    generation = record.generation,
                    artifact_id = %artifact.id,
                    "Artifact ready for review"
                );
                self.emit(
                    PipelineEvent::for_stage(names::DERIVED, campaign_id, stage_id)
                        .with_data(serde_json::json!({ "artifact_id": artifact.id })),
                );
                Ok(DeriveOutcome::Applied(artifact))
            }
            Err(err) => {
                record.return_to_input(Some(err.to_string()));
                warn!(
                    %campaign_id,
                    stage_id,
                    generation = record.generation,
                    error = %err,
                    "Derivation did not produce an artifact"
                );
                self.emit(
                    PipelineEvent::for_stage(names::DERIVE_FAILED, campaign_id, stage_id)
                        .with_data(serde_json::json!({ "code": err.code(), "error": err.to_string() })),
                );
                Ok(DeriveOutcome::Failed(err))
            }
        }
    }

    /// Abandons a stage's in-flight derivation, keeping its input.
    ///
    /// Returns the request id to cancel at the gateway.
    ///
    /// # Errors
    ///
    /// `PreconditionError` if the stage is not deriving.
    pub fn cancel_derive(&mut self, stage_id: &str) -> Result<Option<Uuid>, CampaignflowError> {
        self.registry.stage(stage_id)?;
        let status = self.status_of(stage_id);
        let Some(record) = self
            .records
            .get_mut(stage_id)
            .filter(|r| r.status == StageStatus::Deriving)
        else {
            return Err(PreconditionError::new(
                stage_id,
                "cancel derivation of",
                status,
                "no derivation is in flight",
            )
            .into());
        };

        let request_id = record.request_id;
        record.generation += 1;
        record.return_to_input(None);
        debug!(campaign_id = %self.campaign_id, stage_id, "Derivation cancelled");
        Ok(request_id)
    }

    /// Times out every derivation whose deadline is at or before `now`.
    ///
    /// Returns the affected stages in registry order with their errors.
    pub fn expire_overdue(&mut self, now: Instant) -> Vec<(String, DerivationError)> {
        let timeout_ms = u64::try_from(self.derive_timeout.as_millis()).unwrap_or(u64::MAX);
        let overdue: Vec<String> = self
            .registry
            .ids()
            .filter(|id| self.records.get(*id).is_some_and(|r| r.is_overdue(now)))
            .map(str::to_string)
            .collect();

        let mut expired = Vec::with_capacity(overdue.len());
        for stage_id in overdue {
            let err = DerivationError::timeout(&stage_id, timeout_ms);
            if let Some(record) = self.records.get_mut(&stage_id) {
                record.return_to_input(Some(err.to_string()));
            }
            warn!(campaign_id = %self.campaign_id, stage_id = %stage_id, timeout_ms, "Derivation timed out");
            self.emit(
                PipelineEvent::for_stage(names::DERIVE_FAILED, self.campaign_id, &stage_id)
                    .with_data(serde_json::json!({ "code": err.code(), "error": err.to_string() })),
            );
            expired.push((stage_id, err));
        }
        expired
    }

    // ------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------

    /// Checks every record's field invariants and the ordering invariant:
    /// a stage that is deriving, awaiting review or locked has all of its
    /// dependencies locked.
    pub fn check_invariants(&self) -> Result<(), String> {
        for (stage_id, record) in &self.records {
            let stage = self
                .registry
                .stage(stage_id)
                .map_err(|e| e.to_string())?;
            record
                .check_invariants()
                .map_err(|e| format!("stage '{stage_id}': {e}"))?;
            if record.status >= StageStatus::Deriving {
                if let Some(dep) = stage
                    .depends_on
                    .iter()
                    .find(|dep| !self.status_of(dep).is_locked())
                {
                    return Err(format!(
                        "stage '{stage_id}' is {} but dependency '{dep}' is {}",
                        record.status,
                        self.status_of(dep)
                    ));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    pub(super) fn status_of(&self, stage_id: &str) -> StageStatus {
        self.records
            .get(stage_id)
            .map_or(StageStatus::NotStarted, |r| r.status)
    }

    pub(super) fn emit(&self, event: PipelineEvent) {
        self.events.try_emit(event);
    }

    fn discard(&self, stage_id: &str, reason: &str) -> DeriveOutcome {
        debug!(campaign_id = %self.campaign_id, stage_id, reason, "Discarding derivation result");
        self.emit(
            PipelineEvent::for_stage(names::DERIVE_DISCARDED, self.campaign_id, stage_id)
                .with_data(serde_json::json!({ "reason": reason })),
        );
        DeriveOutcome::Discarded(reason.to_string())
    }
}
