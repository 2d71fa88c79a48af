//! Sample inputs and shortcuts for driving campaigns in tests.

use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::audit::{AuditLog, InMemoryAuditLog};
use crate::core::DerivedArtifact;
use crate::errors::CampaignflowError;
use crate::events::{CollectingEventSink, EventSink};
use crate::pipeline::{DeriveOutcome, PipelineController};
use crate::registry::StageRegistry;

/// Returns a valid input for one of the default campaign stages.
#[must_use]
pub fn sample_input(stage_id: &str) -> serde_json::Value {
    match stage_id {
        "context" => serde_json::json!({
            "goal": "Win back lapsed customers",
            "brand": "Acme Outdoor",
            "budget": 25000,
            "channels": ["email", "push"],
        }),
        "segment" => serde_json::json!({ "strategy": "rfm", "min_recency_days": 90 }),
        "product" => serde_json::json!({ "logic": "top sellers in last purchased category" }),
        "promotion" => serde_json::json!({ "offer_type": "discount", "value": 15 }),
        "creative" => serde_json::json!({ "tone": "warm", "formats": ["email_hero", "push"] }),
        "review" => serde_json::json!({ "approver": "marketing-lead" }),
        _ => serde_json::json!({}),
    }
}

/// A controller over the default campaign stages with an in-memory audit log
/// and a collecting event sink.
#[derive(Debug)]
pub struct ControllerHarness {
    /// The controller under test.
    pub controller: PipelineController,
    /// The audit log it writes to.
    pub audit: Arc<InMemoryAuditLog>,
    /// The events it emitted.
    pub events: Arc<CollectingEventSink>,
}

impl ControllerHarness {
    /// Creates a harness with a 30 second derivation timeout.
    pub fn new() -> Result<Self, CampaignflowError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Creates a harness with the given derivation timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, CampaignflowError> {
        let registry = Arc::new(StageRegistry::campaign_default()?);
        let audit = Arc::new(InMemoryAuditLog::new());
        let events = Arc::new(CollectingEventSink::new());
        let controller = PipelineController::new(
            Uuid::new_v4(),
            registry,
            audit.clone() as Arc<dyn AuditLog>,
            events.clone() as Arc<dyn EventSink>,
            timeout,
        );
        Ok(Self {
            controller,
            audit,
            events,
        })
    }

    /// Submits sample input, derives synchronously and returns the outcome.
    pub fn derive(&mut self, stage_id: &str) -> Result<DeriveOutcome, CampaignflowError> {
        self.controller
            .submit_input(stage_id, sample_input(stage_id))?;
        let ticket = self.controller.start_derive(stage_id)?;
        let artifact = DerivedArtifact::new(
            stage_id,
            &ticket.request.artifact_kind,
            serde_json::json!({ "input": ticket.request.input }),
        );
        Ok(self.controller.complete_derive(&ticket, Ok(artifact))?)
    }

    /// Derives and locks one stage.
    pub fn advance(&mut self, stage_id: &str) -> Result<(), CampaignflowError> {
        self.derive(stage_id)?;
        self.controller.lock(stage_id)
    }

    /// Derives and locks every stage up to and including `last`.
    pub fn advance_through(&mut self, last: &str) -> Result<(), CampaignflowError> {
        let ids: Vec<String> = self
            .controller
            .registry()
            .ids()
            .map(str::to_string)
            .collect();
        for id in ids {
            self.advance(&id)?;
            if id == last {
                break;
            }
        }
        Ok(())
    }

    /// Derives and locks every stage.
    pub fn advance_all(&mut self) -> Result<(), CampaignflowError> {
        let terminal = self.controller.registry().terminal().id.clone();
        self.advance_through(&terminal)
    }

    /// Returns the audit history as `(stage, action)` pairs.
    #[must_use]
    pub fn audit_trail(&self) -> Vec<(String, String)> {
        self.audit
            .entries_for(self.controller.campaign_id())
            .into_iter()
            .map(|e| (e.stage_id, e.action.to_string()))
            .collect()
    }
}
