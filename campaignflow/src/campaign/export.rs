//! Read-only snapshot of a fully locked campaign for review consumers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Campaign;
use crate::audit::AuditLogEntry;
use crate::core::DerivedArtifact;
use crate::errors::{CampaignflowError, PreconditionError};
use crate::utils::{now_utc, Timestamp};

/// One stage in an export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedStage {
    /// Stage id.
    pub stage_id: String,
    /// Stage title.
    pub title: String,
    /// The accepted input.
    pub input: serde_json::Value,
    /// The accepted artifact.
    pub artifact: DerivedArtifact,
    /// When the stage was locked.
    pub locked_at: Timestamp,
}

/// Everything a reviewer needs to sign off a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignExport {
    /// Campaign id.
    pub campaign_id: Uuid,
    /// Campaign name.
    pub name: String,
    /// Creation time.
    pub created_at: Timestamp,
    /// Stages in registry order.
    pub stages: Vec<ExportedStage>,
    /// Full audit history.
    pub audit: Vec<AuditLogEntry>,
    /// When the export was taken.
    pub exported_at: Timestamp,
}

impl CampaignExport {
    /// Builds an export.
    ///
    /// # Errors
    ///
    /// `PreconditionError` naming the first stage that is not locked.
    pub fn build(campaign: &Campaign) -> Result<Self, CampaignflowError> {
        let mut stages = Vec::new();
        for view in campaign.stages() {
            let exported = view.record.and_then(|record| {
                Some(ExportedStage {
                    stage_id: view.stage_id.clone(),
                    title: view.title.clone(),
                    input: record.input?,
                    artifact: record.artifact?,
                    locked_at: record.locked_at?,
                })
            });
            match exported {
                Some(stage) if view.status.is_locked() => stages.push(stage),
                _ => {
                    return Err(PreconditionError::new(
                        view.stage_id,
                        "export",
                        view.status,
                        "every stage must be locked before export",
                    )
                    .into());
                }
            }
        }

        Ok(Self {
            campaign_id: campaign.id(),
            name: campaign.name().to_string(),
            created_at: campaign.created_at(),
            stages,
            audit: campaign.audit_history(),
            exported_at: now_utc(),
        })
    }

    /// Serializes the export as pretty-printed JSON.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
