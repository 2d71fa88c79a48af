//! Per-campaign, per-stage state record.

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::{DerivedArtifact, StageStatus};
use crate::utils::{now_utc, Timestamp};

/// The state of one stage within one campaign.
///
/// Records are created lazily on first input submission and mutated only by
/// the pipeline controller. `artifact` is present iff the status is
/// `PendingReview` or `Locked`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Current lifecycle status.
    pub status: StageStatus,

    /// The raw submission, present from `InputCaptured` onwards.
    pub input: Option<serde_json::Value>,

    /// The derived output, present only in `PendingReview` and `Locked`.
    pub artifact: Option<DerivedArtifact>,

    /// When the stage was locked, present only in `Locked`.
    pub locked_at: Option<Timestamp>,

    /// Derive request counter. Results carrying an older generation are stale.
    pub generation: u64,

    /// Message of the most recent derivation failure or timeout.
    pub last_error: Option<String>,

    /// When the record last changed.
    pub updated_at: Timestamp,

    /// Gateway request id of the in-flight derivation.
    #[serde(skip)]
    pub(crate) request_id: Option<Uuid>,

    /// Deadline of the in-flight derivation.
    #[serde(skip)]
    pub(crate) deadline: Option<Instant>,
}

impl StageRecord {
    /// Creates a record holding freshly captured input.
    #[must_use]
    pub fn captured(input: serde_json::Value) -> Self {
        Self {
            status: StageStatus::InputCaptured,
            input: Some(input),
            artifact: None,
            locked_at: None,
            generation: 0,
            last_error: None,
            updated_at: now_utc(),
            request_id: None,
            deadline: None,
        }
    }

    /// Returns the deadline of the in-flight derivation, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the gateway request id of the in-flight derivation, if any.
    #[must_use]
    pub fn request_id(&self) -> Option<Uuid> {
        self.request_id
    }

    /// Returns true if the in-flight derivation is past its deadline.
    #[must_use]
    pub fn is_overdue(&self, now: Instant) -> bool {
        self.status == StageStatus::Deriving && self.deadline.is_some_and(|d| d <= now)
    }

    /// Checks the structural invariants linking status to the optional fields.
    ///
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.artifact.is_some() != self.status.has_artifact() {
            return Err(format!(
                "artifact presence does not match status {}",
                self.status
            ));
        }
        if self.input.is_some() != self.status.has_input() {
            return Err(format!("input presence does not match status {}", self.status));
        }
        if self.locked_at.is_some() != self.status.is_locked() {
            return Err(format!("locked_at presence does not match status {}", self.status));
        }
        if self.deadline.is_some() != (self.status == StageStatus::Deriving) {
            return Err(format!("deadline presence does not match status {}", self.status));
        }
        Ok(())
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_utc();
    }

    /// Leaves `Deriving` for `InputCaptured`, keeping the input.
    pub(crate) fn return_to_input(&mut self, error: Option<String>) {
        self.status = StageStatus::InputCaptured;
        self.artifact = None;
        self.locked_at = None;
        self.request_id = None;
        self.deadline = None;
        self.last_error = error;
        self.touch();
    }
}
