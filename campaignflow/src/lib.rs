//! # Campaignflow
//!
//! A staged, lock-gated derivation workflow for building marketing campaigns.
//!
//! A campaign moves through an ordered set of stages (context, segment,
//! product, promotion, creative, review). For each stage the user submits
//! input, an external engine derives an artifact from it, and the user locks
//! the result. Campaignflow provides:
//!
//! - **Stage registry**: ordered stages with dependencies and input schemas
//! - **Pipeline controller**: the per-campaign state machine, with downstream
//!   invalidation when an accepted stage is reopened
//! - **Derivation gateway**: cancellable, superseding, retrying and cached
//!   access to the derivation engine
//! - **Audit log**: append-only record of every lock, unlock and invalidation
//! - **Campaign registry**: the single owner of all campaigns
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use campaignflow::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = CampaignRegistry::new(
//!     Arc::new(StageRegistry::campaign_default()?),
//!     Arc::new(MyEngine::new()),
//!     PipelineConfig::default(),
//! );
//!
//! let campaign = registry.create("Spring win-back")?;
//! campaign.submit_input("context", serde_json::json!({
//!     "goal": "Win back lapsed customers",
//!     "brand": "Acme Outdoor",
//! }))?;
//! campaign.derive("context").await?;
//! campaign.lock("context")?;
//! assert_eq!(campaign.current_stage_id().as_deref(), Some("segment"));
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod audit;
pub mod campaign;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod observability;
pub mod pipeline;
pub mod registry;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::audit::{AuditLog, AuditLogEntry, InMemoryAuditLog};
    pub use crate::campaign::{Campaign, CampaignExport, CampaignRegistry, CampaignSummary};
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{BusyPolicy, GatewayConfig, PipelineConfig};
    pub use crate::core::{AuditAction, DerivedArtifact, StageRecord, StageStatus};
    pub use crate::errors::{
        CampaignflowError, DerivationError, InputValidationError, PreconditionError,
        UnknownStageError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink, PipelineEvent};
    pub use crate::gateway::{
        DerivationEngine, DerivationGateway, DerivationRequest, EngineFailure, RetryConfig,
    };
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{DeriveOutcome, PipelineController, UnlockReport};
    pub use crate::registry::{FieldSpec, InputSchema, Stage, StageRegistry};
    pub use crate::utils::{generate_uuid, iso_timestamp, Timestamp};
}
