//! Error types for the campaignflow workflow engine.
//!
//! Every fallible operation returns one of these as a typed result. None of
//! them leave a stage record half-updated: guards are checked before any
//! mutation is applied.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::core::StageStatus;

/// The main error type for campaignflow operations.
#[derive(Debug, Error)]
pub enum CampaignflowError {
    /// A transition guard failed. No state was mutated.
    #[error("{0}")]
    Precondition(#[from] PreconditionError),

    /// Submitted input did not satisfy the stage's input schema.
    #[error("{0}")]
    InputValidation(#[from] InputValidationError),

    /// A stage id is not registered.
    #[error("{0}")]
    UnknownStage(#[from] UnknownStageError),

    /// The stage registry definition is invalid.
    #[error("{0}")]
    Registry(#[from] RegistryValidationError),

    /// The stage registry contains a dependency cycle.
    #[error("{0}")]
    CycleDetected(#[from] CycleDetectedError),

    /// The derivation step did not produce a usable artifact.
    #[error("{0}")]
    Derivation(#[from] DerivationError),

    /// The audit log could not record an entry.
    #[error("{0}")]
    AuditLog(#[from] AuditLogError),

    /// A campaign id does not exist.
    #[error("Campaign not found: {campaign_id}")]
    NotFound {
        /// The missing campaign id.
        campaign_id: Uuid,
    },

    /// A campaign name was empty or whitespace-only.
    #[error("Campaign name cannot be empty or whitespace-only")]
    InvalidName,
}

impl CampaignflowError {
    /// Creates a not found error.
    #[must_use]
    pub fn not_found(campaign_id: Uuid) -> Self {
        Self::NotFound { campaign_id }
    }

    /// Returns a stable, machine-readable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Precondition(_) => "PIPELINE-PRECONDITION",
            Self::InputValidation(_) => "PIPELINE-INVALID-INPUT",
            Self::UnknownStage(_) => "REGISTRY-UNKNOWN-STAGE",
            Self::Registry(_) => "REGISTRY-INVALID",
            Self::CycleDetected(_) => "REGISTRY-CYCLE",
            Self::Derivation(err) => err.code(),
            Self::AuditLog(_) => "AUDIT-STORAGE",
            Self::NotFound { .. } => "CAMPAIGN-NOT-FOUND",
            Self::InvalidName => "CAMPAIGN-INVALID-NAME",
        }
    }

    /// Returns true if the caller can recover by correcting input or retrying.
    ///
    /// Unknown ids and registry errors are programming errors and are never
    /// retried automatically.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Precondition(_) | Self::InputValidation(_) | Self::InvalidName => true,
            Self::Derivation(err) => err.is_recoverable(),
            Self::UnknownStage(_)
            | Self::Registry(_)
            | Self::CycleDetected(_)
            | Self::AuditLog(_)
            | Self::NotFound { .. } => false,
        }
    }

    /// Converts to an error payload the view layer can render.
    #[must_use]
    pub fn to_info(&self) -> ErrorInfo {
        let mut info = ErrorInfo::new(self.code(), self.to_string());
        if let Some(hint) = ErrorSuggestions::get(self.code()) {
            info = info.with_fix_hint(hint);
        }
        match self {
            Self::Precondition(err) => info
                .with_context_entry("stage_id", &err.stage_id)
                .with_context_entry("operation", &err.operation)
                .with_context_entry("status", err.status.to_string()),
            Self::InputValidation(err) => info.with_context_entry("stage_id", &err.stage_id),
            Self::UnknownStage(err) => info.with_context_entry("stage_id", &err.stage_id),
            Self::Derivation(err) => match err.stage_id() {
                Some(stage_id) => info.with_context_entry("stage_id", stage_id),
                None => info,
            },
            Self::NotFound { campaign_id } => {
                info.with_context_entry("campaign_id", campaign_id.to_string())
            }
            _ => info,
        }
    }
}

/// Structured error payload for display.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "PIPELINE-PRECONDITION").
    pub code: String,
    /// Human-readable summary.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Error raised when a transition guard fails.
#[derive(Debug, Clone, Error)]
#[error("Cannot {operation} stage '{stage_id}' while {status}: {message}")]
pub struct PreconditionError {
    /// The stage the transition targeted.
    pub stage_id: String,
    /// The attempted operation (e.g., "lock").
    pub operation: String,
    /// The stage status at the time of the attempt.
    pub status: StageStatus,
    /// Why the guard failed.
    pub message: String,
}

impl PreconditionError {
    /// Creates a new precondition error.
    #[must_use]
    pub fn new(
        stage_id: impl Into<String>,
        operation: impl Into<String>,
        status: StageStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            operation: operation.into(),
            status,
            message: message.into(),
        }
    }

    /// Creates an error for a stage whose dependencies are not all locked.
    #[must_use]
    pub fn dependencies_not_locked(
        stage_id: impl Into<String>,
        operation: impl Into<String>,
        status: StageStatus,
        pending: &[String],
    ) -> Self {
        Self::new(
            stage_id,
            operation,
            status,
            format!("dependencies not locked: {}", pending.join(", ")),
        )
    }
}

/// Error raised when submitted input violates a stage's input schema.
#[derive(Debug, Clone, Error)]
#[error("Invalid input for stage '{stage_id}': {}", violations.join("; "))]
pub struct InputValidationError {
    /// The stage the input was submitted to.
    pub stage_id: String,
    /// Every violation found.
    pub violations: Vec<String>,
}

impl InputValidationError {
    /// Creates a new input validation error.
    #[must_use]
    pub fn new(stage_id: impl Into<String>, violations: Vec<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            violations,
        }
    }
}

/// Error raised when a stage id is not registered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown stage: '{stage_id}'")]
pub struct UnknownStageError {
    /// The unregistered stage id.
    pub stage_id: String,
}

impl UnknownStageError {
    /// Creates a new unknown stage error.
    #[must_use]
    pub fn new(stage_id: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
        }
    }
}

/// Error raised when a stage registry definition is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RegistryValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl RegistryValidationError {
    /// Creates a new registry validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }
}

/// Error raised when stage dependencies form a cycle.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in stage registry: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle, first stage repeated at the end.
    pub cycle_path: Vec<String>,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        Self { cycle_path }
    }
}

impl From<CycleDetectedError> for RegistryValidationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path,
        }
    }
}

/// Errors produced by the derivation gateway.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DerivationError {
    /// The external computation failed.
    #[error("Derivation failed for stage '{stage_id}': {reason}")]
    Failed {
        /// The stage being derived.
        stage_id: String,
        /// Human-readable reason.
        reason: String,
    },

    /// No result arrived before the deadline.
    #[error("Derivation timed out for stage '{stage_id}' after {timeout_ms}ms")]
    Timeout {
        /// The stage being derived.
        stage_id: String,
        /// The configured deadline in milliseconds.
        timeout_ms: u64,
    },

    /// A derivation is already in flight for this campaign and stage.
    #[error("Derivation already in flight for stage '{stage_id}' of campaign {campaign_id}")]
    Busy {
        /// The campaign id.
        campaign_id: Uuid,
        /// The stage id.
        stage_id: String,
    },

    /// The request was cancelled or superseded before it completed.
    #[error("Derivation request {request_id} cancelled: {reason}")]
    Cancelled {
        /// The cancelled request id.
        request_id: Uuid,
        /// Why it was cancelled.
        reason: String,
    },
}

impl DerivationError {
    /// Creates a failed derivation error.
    #[must_use]
    pub fn failed(stage_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            stage_id: stage_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(stage_id: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            stage_id: stage_id.into(),
            timeout_ms,
        }
    }

    /// Creates a busy error.
    #[must_use]
    pub fn busy(campaign_id: Uuid, stage_id: impl Into<String>) -> Self {
        Self::Busy {
            campaign_id,
            stage_id: stage_id.into(),
        }
    }

    /// Creates a cancelled error.
    #[must_use]
    pub fn cancelled(request_id: Uuid, reason: impl Into<String>) -> Self {
        Self::Cancelled {
            request_id,
            reason: reason.into(),
        }
    }

    /// Returns the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Failed { .. } => "DERIVATION-FAILED",
            Self::Timeout { .. } => "DERIVATION-TIMEOUT",
            Self::Busy { .. } => "DERIVATION-BUSY",
            Self::Cancelled { .. } => "DERIVATION-CANCELLED",
        }
    }

    /// Returns the stage id, if the variant carries one.
    #[must_use]
    pub fn stage_id(&self) -> Option<&str> {
        match self {
            Self::Failed { stage_id, .. }
            | Self::Timeout { stage_id, .. }
            | Self::Busy { stage_id, .. } => Some(stage_id),
            Self::Cancelled { .. } => None,
        }
    }

    /// All derivation errors leave the stage resubmittable.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        true
    }
}

/// Error raised when the audit log cannot store an entry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuditLogError {
    /// The backing store rejected the write.
    #[error("Audit log storage fault: {0}")]
    Storage(String),
}

/// Provides default suggestions for common error codes.
pub struct ErrorSuggestions;

impl ErrorSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            "PIPELINE-PRECONDITION" => Some(
                "Lock every upstream stage first, or unlock / request an edit \
                 before changing a stage that already has an artifact.",
            ),
            "PIPELINE-INVALID-INPUT" => Some(
                "Fill in every required field with a value of the expected type.",
            ),
            "DERIVATION-FAILED" | "DERIVATION-TIMEOUT" => Some(
                "The stage input was kept. Resubmit it as-is or edit it and derive again.",
            ),
            "REGISTRY-CYCLE" => Some(
                "Stages may only depend on stages registered before them.",
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_error_message() {
        let err = PreconditionError::new("segment", "lock", StageStatus::InputCaptured, "no artifact");
        let msg = err.to_string();
        assert!(msg.contains("lock"));
        assert!(msg.contains("segment"));
        assert!(msg.contains("input_captured"));
    }

    #[test]
    fn test_dependencies_not_locked_lists_pending() {
        let err = PreconditionError::dependencies_not_locked(
            "creative",
            "derive",
            StageStatus::InputCaptured,
            &["segment".to_string(), "promotion".to_string()],
        );
        assert!(err.message.contains("segment, promotion"));
    }

    #[test]
    fn test_cycle_detected_error() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert!(err.to_string().contains("a -> b -> a"));

        let validation: RegistryValidationError = err.into();
        assert_eq!(validation.stages.len(), 3);
    }

    #[test]
    fn test_error_codes() {
        let err: CampaignflowError = DerivationError::timeout("context", 500).into();
        assert_eq!(err.code(), "DERIVATION-TIMEOUT");
        assert!(err.is_recoverable());

        let err: CampaignflowError = UnknownStageError::new("nope").into();
        assert_eq!(err.code(), "REGISTRY-UNKNOWN-STAGE");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_to_info_carries_context() {
        let err: CampaignflowError =
            PreconditionError::new("review", "lock", StageStatus::NotStarted, "nothing to lock").into();
        let info = err.to_info();

        assert_eq!(info.code, "PIPELINE-PRECONDITION");
        assert_eq!(info.context.get("stage_id"), Some(&"review".to_string()));
        assert_eq!(info.context.get("status"), Some(&"not_started".to_string()));
        assert!(info.fix_hint.is_some());
    }

    #[test]
    fn test_input_validation_error_joins_violations() {
        let err = InputValidationError::new(
            "context",
            vec!["missing field 'goal'".to_string(), "field 'budget' must be a number".to_string()],
        );
        assert!(err.to_string().contains("missing field 'goal'; field 'budget'"));
    }
}
