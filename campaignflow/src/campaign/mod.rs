//! Campaigns and the registry that owns them.

mod aggregate;
mod export;
mod registry;

pub use aggregate::{Campaign, CampaignSummary};
pub use export::{CampaignExport, ExportedStage};
pub use registry::CampaignRegistry;
