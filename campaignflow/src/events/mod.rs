//! Event sink system for observability.
//!
//! The pipeline reports what happens to each campaign (`campaign.created`,
//! `stage.derived`, `stage.locked`, `stage.invalidated`, ...) as
//! [`PipelineEvent`]s. Sinks are fire-and-forget: emitting never fails and
//! never changes pipeline state.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::{now_utc, Timestamp};

/// Event type names emitted by the pipeline.
pub mod names {
    /// A campaign was created.
    pub const CAMPAIGN_CREATED: &str = "campaign.created";
    /// A campaign was deleted.
    pub const CAMPAIGN_DELETED: &str = "campaign.deleted";
    /// Input was accepted for a stage.
    pub const INPUT_CAPTURED: &str = "stage.input_captured";
    /// A derivation was started.
    pub const DERIVE_STARTED: &str = "stage.derive_started";
    /// A derived artifact was applied.
    pub const DERIVED: &str = "stage.derived";
    /// A derivation failed or timed out.
    pub const DERIVE_FAILED: &str = "stage.derive_failed";
    /// A derivation result arrived too late and was dropped.
    pub const DERIVE_DISCARDED: &str = "stage.derive_discarded";
    /// A stage was locked.
    pub const LOCKED: &str = "stage.locked";
    /// A stage was unlocked.
    pub const UNLOCKED: &str = "stage.unlocked";
    /// A stage was reset by an upstream unlock.
    pub const INVALIDATED: &str = "stage.invalidated";
    /// A reviewed stage was sent back for edits.
    pub const EDIT_REQUESTED: &str = "stage.edit_requested";
}

/// A single observability event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Dotted event type, e.g. `stage.locked`.
    pub event_type: String,
    /// Campaign the event belongs to.
    pub campaign_id: Uuid,
    /// Stage the event concerns, if any.
    pub stage_id: Option<String>,
    /// Free-form payload.
    pub data: serde_json::Value,
    /// When the event was produced.
    pub timestamp: Timestamp,
}

impl PipelineEvent {
    /// Creates a campaign-level event.
    #[must_use]
    pub fn new(event_type: impl Into<String>, campaign_id: Uuid) -> Self {
        Self {
            event_type: event_type.into(),
            campaign_id,
            stage_id: None,
            data: serde_json::Value::Null,
            timestamp: now_utc(),
        }
    }

    /// Creates a stage-level event.
    #[must_use]
    pub fn for_stage(event_type: impl Into<String>, campaign_id: Uuid, stage_id: &str) -> Self {
        let mut event = Self::new(event_type, campaign_id);
        event.stage_id = Some(stage_id.to_string());
        event
    }

    /// Attaches a payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
