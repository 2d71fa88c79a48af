//! The stock campaign-building workflow.

use super::{FieldSpec, InputSchema, Stage, StageRegistry};
use crate::errors::CampaignflowError;

/// Stage ids of the stock workflow, in order.
pub const CAMPAIGN_STAGES: [&str; 6] = [
    "context",
    "segment",
    "product",
    "promotion",
    "creative",
    "review",
];

impl StageRegistry {
    /// Builds the six-stage campaign workflow:
    /// context → segment → product → promotion → creative → review.
    ///
    /// `creative` needs both the segments and the promotion; `review` needs
    /// every other stage.
    pub fn campaign_default() -> Result<Self, CampaignflowError> {
        Self::builder()
            .stage(
                Stage::new("context", "Campaign context")
                    .with_artifact_kind("brief")
                    .with_schema(
                        InputSchema::new()
                            .field(FieldSpec::text("goal").required())
                            .field(FieldSpec::text("brand").required())
                            .field(FieldSpec::number("budget"))
                            .field(FieldSpec::text("timeframe"))
                            .field(FieldSpec::list("channels")),
                    ),
            )
            .stage(
                Stage::new("segment", "Audience segments")
                    .with_dependency("context")
                    .with_artifact_kind("segments")
                    .with_schema(
                        InputSchema::new()
                            .field(
                                FieldSpec::text("strategy")
                                    .required()
                                    .with_pattern(r"^(rfm|behavioral|lifecycle|custom)$"),
                            )
                            .field(FieldSpec::number("max_segments")),
                    ),
            )
            .stage(
                Stage::new("product", "Product logic")
                    .with_dependency("segment")
                    .with_artifact_kind("product_rules")
                    .with_schema(
                        InputSchema::new()
                            .field(FieldSpec::text("logic").required())
                            .field(FieldSpec::list("skus")),
                    ),
            )
            .stage(
                Stage::new("promotion", "Promotion")
                    .with_dependency("product")
                    .with_artifact_kind("offer")
                    .with_schema(
                        InputSchema::new()
                            .field(
                                FieldSpec::text("offer_type")
                                    .required()
                                    .with_pattern(r"^(discount|bundle|loyalty_points|free_shipping)$"),
                            )
                            .field(FieldSpec::number("value")),
                    ),
            )
            .stage(
                Stage::new("creative", "Creative")
                    .with_dependencies(["segment", "promotion"])
                    .with_artifact_kind("creatives")
                    .with_schema(
                        InputSchema::new()
                            .field(FieldSpec::text("tone").required())
                            .field(FieldSpec::list("formats").required()),
                    ),
            )
            .stage(
                Stage::new("review", "Review & export")
                    .with_dependencies(["context", "segment", "product", "promotion", "creative"])
                    .with_artifact_kind("summary")
                    .with_schema(InputSchema::new().field(FieldSpec::text("approver").required()))
                    .terminal(),
            )
            .build()
    }
}
