//! Review transitions: lock, unlock with downstream invalidation, and edits.

use tracing::{debug, info};

use super::{PipelineController, UnlockReport};
use crate::audit::AuditLogEntry;
use crate::core::{AuditAction, StageStatus};
use crate::errors::{CampaignflowError, PreconditionError};
use crate::events::{names, PipelineEvent};
use crate::utils::now_utc;

impl PipelineController {
    /// Accepts a stage's artifact.
    ///
    /// # Errors
    ///
    /// - `PreconditionError` unless the stage is awaiting review
    /// - `AuditLogError` if the lock could not be recorded; the stage is unchanged
    pub fn lock(&mut self, stage_id: &str) -> Result<(), CampaignflowError> {
        self.registry().stage(stage_id)?;
        let status = self.status_of(stage_id);
        if status != StageStatus::PendingReview {
            let message = match status {
                StageStatus::Locked => "the stage is already locked",
                _ => "there is no artifact to review",
            };
            return Err(PreconditionError::new(stage_id, "lock", status, message).into());
        }
        let pending = self.pending_dependencies(stage_id)?;
        if !pending.is_empty() {
            return Err(
                PreconditionError::dependencies_not_locked(stage_id, "lock", status, &pending)
                    .into(),
            );
        }

        self.audit.append(AuditLogEntry::new(
            self.campaign_id(),
            stage_id,
            AuditAction::Locked,
        ))?;

        if let Some(record) = self.records.get_mut(stage_id) {
            record.status = StageStatus::Locked;
            record.locked_at = Some(now_utc());
            record.touch();
        }

        info!(campaign_id = %self.campaign_id(), stage_id, "Stage locked");
        self.emit(PipelineEvent::for_stage(
            names::LOCKED,
            self.campaign_id(),
            stage_id,
        ));
        Ok(())
    }

    /// Reopens a locked stage for review and resets everything downstream.
    ///
    /// Every transitive dependent that has a record is reset to
    /// `NotStarted`, losing its input and artifact. The `Unlocked` entry and
    /// one `Invalidated` entry per reset stage are recorded together before
    /// anything changes.
    ///
    /// # Errors
    ///
    /// - `PreconditionError` unless the stage is locked
    /// - `AuditLogError` if the entries could not be recorded; nothing is reset
    pub fn unlock(&mut self, stage_id: &str) -> Result<UnlockReport, CampaignflowError> {
        let registry = self.registry().clone();
        registry.stage(stage_id)?;
        let status = self.status_of(stage_id);
        if status != StageStatus::Locked {
            return Err(PreconditionError::new(
                stage_id,
                "unlock",
                status,
                "only a locked stage can be unlocked",
            )
            .into());
        }

        let campaign_id = self.campaign_id();
        let affected: Vec<String> = registry
            .dependents_of(stage_id)?
            .iter()
            .filter(|dep| self.records.contains_key(dep.as_str()))
            .cloned()
            .collect();

        let mut entries = Vec::with_capacity(affected.len() + 1);
        entries.push(AuditLogEntry::new(campaign_id, stage_id, AuditAction::Unlocked));
        entries.extend(
            affected
                .iter()
                .map(|dep| AuditLogEntry::new(campaign_id, dep.as_str(), AuditAction::Invalidated)),
        );
        self.audit.append_all(entries)?;

        if let Some(record) = self.records.get_mut(stage_id) {
            record.status = StageStatus::PendingReview;
            record.locked_at = None;
            record.touch();
        }

        let mut report = UnlockReport::default();
        for dep in affected {
            if let Some(removed) = self.records.remove(&dep) {
                if let Some(request_id) = removed.request_id {
                    report.cancelled_requests.push(request_id);
                }
                debug!(%campaign_id, stage_id = %dep, was = %removed.status, "Stage invalidated");
            }
            self.emit(
                PipelineEvent::for_stage(names::INVALIDATED, campaign_id, &dep)
                    .with_data(serde_json::json!({ "cause": stage_id })),
            );
            report.invalidated.push(dep);
        }

        info!(
            %campaign_id,
            stage_id,
            invalidated = report.invalidated.len(),
            "Stage unlocked"
        );
        self.emit(
            PipelineEvent::for_stage(names::UNLOCKED, campaign_id, stage_id)
                .with_data(serde_json::json!({ "invalidated": report.invalidated })),
        );
        Ok(report)
    }

    /// Sends a stage awaiting review back to input editing.
    ///
    /// The artifact is dropped and the input kept.
    ///
    /// # Errors
    ///
    /// `PreconditionError` unless the stage is awaiting review.
    pub fn request_edit(&mut self, stage_id: &str) -> Result<(), CampaignflowError> {
        self.registry().stage(stage_id)?;
        let status = self.status_of(stage_id);
        let Some(record) = self
            .records
            .get_mut(stage_id)
            .filter(|r| r.status == StageStatus::PendingReview)
        else {
            return Err(PreconditionError::new(
                stage_id,
                "request an edit of",
                status,
                "only a stage awaiting review can be edited",
            )
            .into());
        };

        record.return_to_input(None);
        debug!(campaign_id = %self.campaign_id(), stage_id, "Edit requested");
        self.emit(PipelineEvent::for_stage(
            names::EDIT_REQUESTED,
            self.campaign_id(),
            stage_id,
        ));
        Ok(())
    }
}
