//! The pipeline controller.
//!
//! One [`PipelineController`] per campaign owns the stage records and enforces
//! the lifecycle:
//!
//! ```text
//! NotStarted -> InputCaptured -> Deriving -> PendingReview -> Locked
//! ```
//!
//! with the back edges: a failed, timed out or cancelled derivation returns
//! to `InputCaptured`, `request_edit` sends a reviewed stage back to
//! `InputCaptured`, and `unlock` reopens a locked stage for review while
//! resetting every downstream stage to `NotStarted`.

mod cascade;
mod controller;

pub use controller::{
    DerivationTicket, DeriveOutcome, PipelineController, StageView, UnlockReport,
};

#[cfg(test)]
mod integration_tests;
