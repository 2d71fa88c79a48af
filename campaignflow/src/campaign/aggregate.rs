//! A single campaign: its controller plus the shared gateway and audit log.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::audit::{AuditLog, AuditLogEntry};
use crate::core::{DerivedArtifact, StageRecord, StageStatus};
use crate::errors::{CampaignflowError, DerivationError, UnknownStageError};
use crate::gateway::DerivationGateway;
use crate::observability::SpanTimer;
use crate::pipeline::{DeriveOutcome, PipelineController, StageView, UnlockReport};
use crate::utils::Timestamp;

/// Listing entry for a campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignSummary {
    /// Campaign id.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Creation time.
    pub created_at: Timestamp,
    /// First stage that is not locked, or `None` when complete.
    pub current_stage: Option<String>,
    /// Number of locked stages.
    pub locked_stages: usize,
    /// Number of stages in the registry.
    pub total_stages: usize,
}

/// A campaign being built stage by stage.
///
/// All transitions go through the campaign's controller under a mutex that is
/// never held across an await, so concurrent callers see each transition
/// either fully applied or not at all. Once the campaign is deleted from its
/// registry every transition fails with `NotFound`.
#[derive(Debug)]
pub struct Campaign {
    id: Uuid,
    name: String,
    created_at: Timestamp,
    pub(super) sequence: u64,
    controller: Mutex<PipelineController>,
    deleted: AtomicBool,
    gateway: Arc<DerivationGateway>,
    audit: Arc<dyn AuditLog>,
}

impl Campaign {
    pub(super) fn new(
        name: String,
        created_at: Timestamp,
        sequence: u64,
        controller: PipelineController,
        gateway: Arc<DerivationGateway>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            id: controller.campaign_id(),
            name,
            created_at,
            sequence,
            controller: Mutex::new(controller),
            deleted: AtomicBool::new(false),
            gateway,
            audit,
        }
    }

    /// Returns the campaign id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the campaign name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the creation time.
    #[must_use]
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// Returns true once the campaign has been deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Closes the campaign to further transitions.
    ///
    /// Taken under the controller lock, so every transition either finished
    /// before this returns or fails afterwards.
    pub(super) fn mark_deleted(&self) {
        let _controller = self.controller.lock();
        self.deleted.store(true, Ordering::SeqCst);
    }

    fn transition(&self) -> Result<MutexGuard<'_, PipelineController>, CampaignflowError> {
        let controller = self.controller.lock();
        if self.is_deleted() {
            return Err(CampaignflowError::not_found(self.id));
        }
        Ok(controller)
    }

    /// Captures input for a stage, cancelling any derivation it supersedes.
    pub fn submit_input(
        &self,
        stage_id: &str,
        input: serde_json::Value,
    ) -> Result<(), CampaignflowError> {
        let superseded = self.transition()?.submit_input(stage_id, input)?;
        if let Some(request_id) = superseded {
            self.gateway.cancel(request_id, "superseded by new input");
        }
        Ok(())
    }

    /// Derives a stage's artifact and waits for it.
    ///
    /// On success the stage is awaiting review. On failure or timeout the
    /// stage is back to `InputCaptured` with its input intact.
    ///
    /// # Errors
    ///
    /// - `PreconditionError` if the stage cannot be derived now
    /// - `DerivationError::Failed` or `DerivationError::Timeout` if no artifact was produced
    /// - `DerivationError::Cancelled` if the derivation was superseded,
    ///   invalidated or cancelled while in flight
    /// - `NotFound` if the campaign was deleted
    #[instrument(skip(self), fields(campaign_id = %self.id))]
    pub async fn derive(&self, stage_id: &str) -> Result<DerivedArtifact, CampaignflowError> {
        let (ticket, pending) = {
            let mut controller = self.transition()?;
            let ticket = controller.start_derive(stage_id)?;
            // Registered while the lock is held, so a supersede, unlock or
            // delete that follows can always cancel it by id.
            let pending = self.gateway.prepare(ticket.request.clone());
            (ticket, pending)
        };
        let request_id = ticket.request.request_id;
        let timer = SpanTimer::start(stage_id);

        // Dropping the pending derivation on timeout cancels the engine call.
        let result = match pending {
            Ok(pending) => tokio::time::timeout_at(ticket.deadline, pending.run())
                .await
                .unwrap_or_else(|_| Err(DerivationError::timeout(stage_id, ticket.timeout_ms()))),
            Err(err) => Err(err),
        };

        let outcome = self.transition()?.complete_derive(&ticket, result)?;
        debug!(
            stage_id,
            %request_id,
            duration_ms = timer.finish(),
            "Derivation finished"
        );

        match outcome {
            DeriveOutcome::Applied(artifact) => Ok(artifact),
            DeriveOutcome::Failed(err) => Err(err.into()),
            // Reset by the deadline reaper before this call's own timer fired.
            DeriveOutcome::Discarded(_) if Instant::now() >= ticket.deadline => {
                Err(DerivationError::timeout(stage_id, ticket.timeout_ms()).into())
            }
            DeriveOutcome::Discarded(reason) => {
                Err(DerivationError::cancelled(request_id, reason).into())
            }
        }
    }

    /// Cancels a stage's in-flight derivation, keeping its input.
    pub fn cancel_derive(&self, stage_id: &str) -> Result<(), CampaignflowError> {
        let request_id = self.transition()?.cancel_derive(stage_id)?;
        if let Some(request_id) = request_id {
            self.gateway.cancel(request_id, "cancelled by user");
        }
        Ok(())
    }

    /// Accepts a stage's artifact.
    pub fn lock(&self, stage_id: &str) -> Result<(), CampaignflowError> {
        self.transition()?.lock(stage_id)
    }

    /// Reopens a locked stage and resets everything downstream.
    pub fn unlock(&self, stage_id: &str) -> Result<UnlockReport, CampaignflowError> {
        let report = self.transition()?.unlock(stage_id)?;
        for request_id in &report.cancelled_requests {
            self.gateway
                .cancel(*request_id, &format!("invalidated by unlock of '{stage_id}'"));
        }
        Ok(report)
    }

    /// Sends a stage awaiting review back to input editing.
    pub fn request_edit(&self, stage_id: &str) -> Result<(), CampaignflowError> {
        self.transition()?.request_edit(stage_id)
    }

    /// Times out derivations past their deadline and cancels their requests.
    ///
    /// A deleted campaign has nothing to expire.
    pub fn expire_overdue(&self) -> Vec<(String, DerivationError)> {
        let Ok(mut controller) = self.transition() else {
            return Vec::new();
        };
        let now = Instant::now();
        let requests: Vec<Uuid> = controller
            .records()
            .filter_map(|(_, record)| record.filter(|r| r.is_overdue(now)))
            .filter_map(StageRecord::request_id)
            .collect();
        let expired = controller.expire_overdue(now);
        drop(controller);

        for request_id in requests {
            self.gateway.cancel(request_id, "derivation deadline passed");
        }
        expired
    }

    /// Returns a stage's status.
    pub fn status(&self, stage_id: &str) -> Result<StageStatus, UnknownStageError> {
        self.controller.lock().status(stage_id)
    }

    /// Returns a copy of a stage's record.
    pub fn record(&self, stage_id: &str) -> Result<Option<StageRecord>, UnknownStageError> {
        Ok(self.controller.lock().record(stage_id)?.cloned())
    }

    /// Returns every stage in registry order.
    #[must_use]
    pub fn stages(&self) -> Vec<StageView> {
        self.controller.lock().snapshot()
    }

    /// Returns the id of the first stage that is not locked.
    #[must_use]
    pub fn current_stage_id(&self) -> Option<String> {
        self.controller.lock().current_stage_id().map(str::to_string)
    }

    /// Returns true once every stage is locked.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.controller.lock().is_complete()
    }

    /// Returns the campaign's audit history.
    #[must_use]
    pub fn audit_history(&self) -> Vec<AuditLogEntry> {
        self.audit.entries_for(self.id)
    }

    /// Checks the controller's invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.controller.lock().check_invariants()
    }

    /// Returns a listing entry.
    #[must_use]
    pub fn summary(&self) -> CampaignSummary {
        let controller = self.controller.lock();
        let locked_stages = controller
            .records()
            .filter(|(_, record)| record.is_some_and(|r| r.status.is_locked()))
            .count();
        CampaignSummary {
            id: self.id,
            name: self.name.clone(),
            created_at: self.created_at,
            current_stage: controller.current_stage_id().map(str::to_string),
            locked_stages,
            total_stages: controller.registry().len(),
        }
    }
}
