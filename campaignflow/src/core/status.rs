//! Stage status and audit action enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of one stage within one campaign.
///
/// Variants are declared in forward order, so `Ord` compares progress:
/// `status >= StageStatus::PendingReview` means an artifact exists.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// No input has been captured.
    #[default]
    NotStarted,
    /// Input captured, not yet derived.
    InputCaptured,
    /// A derivation request is in flight.
    Deriving,
    /// An artifact exists and awaits review.
    PendingReview,
    /// The artifact was accepted.
    Locked,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::InputCaptured => write!(f, "input_captured"),
            Self::Deriving => write!(f, "deriving"),
            Self::PendingReview => write!(f, "pending_review"),
            Self::Locked => write!(f, "locked"),
        }
    }
}

impl StageStatus {
    /// Returns true if a record in this status must hold an artifact.
    #[must_use]
    pub fn has_artifact(&self) -> bool {
        matches!(self, Self::PendingReview | Self::Locked)
    }

    /// Returns true if a record in this status must hold input.
    #[must_use]
    pub fn has_input(&self) -> bool {
        !matches!(self, Self::NotStarted)
    }

    /// Returns true if the stage is locked.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked)
    }
}

/// The kind of event recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// A stage's artifact was accepted.
    Locked,
    /// A locked stage was reopened for review.
    Unlocked,
    /// A downstream stage was reset by an upstream unlock.
    Invalidated,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => write!(f, "locked"),
            Self::Unlocked => write!(f, "unlocked"),
            Self::Invalidated => write!(f, "invalidated"),
        }
    }
}
