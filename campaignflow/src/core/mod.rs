//! Core domain model types for campaignflow.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Stage status and audit action enums
//! - Derived artifacts
//! - Per-stage records

mod artifact;
mod record;
mod status;

pub use artifact::DerivedArtifact;
pub use record::StageRecord;
pub use status::{AuditAction, StageStatus};
