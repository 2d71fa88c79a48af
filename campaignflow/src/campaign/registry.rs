//! Owner of every campaign in the process.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Campaign, CampaignSummary};
use crate::audit::{AuditLog, InMemoryAuditLog};
use crate::config::PipelineConfig;
use crate::errors::CampaignflowError;
use crate::events::{names, EventSink, LoggingEventSink, PipelineEvent};
use crate::gateway::{DerivationEngine, DerivationGateway};
use crate::pipeline::PipelineController;
use crate::registry::StageRegistry;
use crate::utils::{generate_uuid, now_utc};

/// Creates, finds and deletes campaigns.
///
/// Campaigns share one stage registry, one derivation gateway, one audit log
/// and one event sink. Each campaign has its own controller.
#[derive(Debug)]
pub struct CampaignRegistry {
    stages: Arc<StageRegistry>,
    gateway: Arc<DerivationGateway>,
    audit: Arc<dyn AuditLog>,
    events: Arc<dyn EventSink>,
    config: PipelineConfig,
    campaigns: DashMap<Uuid, Arc<Campaign>>,
    next_sequence: AtomicU64,
}

impl CampaignRegistry {
    /// Creates a registry with an in-memory audit log and a logging event sink.
    #[must_use]
    pub fn new(
        stages: Arc<StageRegistry>,
        engine: Arc<dyn DerivationEngine>,
        config: PipelineConfig,
    ) -> Self {
        let gateway = Arc::new(DerivationGateway::new(engine, config.gateway.clone()));
        Self {
            stages,
            gateway,
            audit: Arc::new(InMemoryAuditLog::new()),
            events: Arc::new(LoggingEventSink::default()),
            config,
            campaigns: DashMap::new(),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Replaces the audit log. Call before creating campaigns.
    #[must_use]
    pub fn with_audit_log(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Replaces the event sink. Call before creating campaigns.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the stage registry.
    #[must_use]
    pub fn stages(&self) -> &Arc<StageRegistry> {
        &self.stages
    }

    /// Returns the shared derivation gateway.
    #[must_use]
    pub fn gateway(&self) -> &Arc<DerivationGateway> {
        &self.gateway
    }

    /// Returns the shared audit log.
    #[must_use]
    pub fn audit_log(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Creates an empty campaign.
    ///
    /// # Errors
    ///
    /// `InvalidName` if the name is empty or whitespace-only.
    pub fn create(&self, name: &str) -> Result<Arc<Campaign>, CampaignflowError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CampaignflowError::InvalidName);
        }

        let id = generate_uuid();
        let controller = PipelineController::new(
            id,
            self.stages.clone(),
            self.audit.clone(),
            self.events.clone(),
            self.config.derive_timeout(),
        );
        let campaign = Arc::new(Campaign::new(
            name.to_string(),
            now_utc(),
            self.next_sequence.fetch_add(1, Ordering::SeqCst),
            controller,
            self.gateway.clone(),
            self.audit.clone(),
        ));
        self.campaigns.insert(id, campaign.clone());

        info!(campaign_id = %id, name, "Campaign created");
        self.events.try_emit(
            PipelineEvent::new(names::CAMPAIGN_CREATED, id)
                .with_data(serde_json::json!({ "name": name })),
        );
        Ok(campaign)
    }

    /// Returns a campaign by id.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Arc<Campaign>> {
        self.campaigns.get(&id).map(|entry| entry.value().clone())
    }

    /// Returns a campaign by id.
    ///
    /// # Errors
    ///
    /// `NotFound` if no campaign has this id.
    pub fn require(&self, id: Uuid) -> Result<Arc<Campaign>, CampaignflowError> {
        self.get(id).ok_or_else(|| CampaignflowError::not_found(id))
    }

    /// Deletes a campaign, cancelling its derivations and dropping its audit
    /// history and cached artifacts.
    ///
    /// Handles still held elsewhere stay readable, but every transition on
    /// them fails with `NotFound`.
    ///
    /// # Errors
    ///
    /// `NotFound` if no campaign has this id, including when it was already deleted.
    pub fn delete(&self, id: Uuid) -> Result<(), CampaignflowError> {
        let Some((_, campaign)) = self.campaigns.remove(&id) else {
            return Err(CampaignflowError::not_found(id));
        };

        campaign.mark_deleted();
        let cancelled = self.gateway.cancel_campaign(id, "campaign deleted");
        self.gateway.forget_campaign(id);
        self.audit.discard(id);

        info!(campaign_id = %id, name = campaign.name(), cancelled, "Campaign deleted");
        self.events
            .try_emit(PipelineEvent::new(names::CAMPAIGN_DELETED, id));
        Ok(())
    }

    /// Lists campaigns in creation order.
    #[must_use]
    pub fn list(&self) -> Vec<CampaignSummary> {
        let mut campaigns: Vec<Arc<Campaign>> = self
            .campaigns
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        campaigns.sort_by_key(|c| c.sequence);
        campaigns.iter().map(|c| c.summary()).collect()
    }

    /// Returns the number of campaigns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.campaigns.len()
    }

    /// Returns true if there are no campaigns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.campaigns.is_empty()
    }

    /// Times out overdue derivations across all campaigns and purges expired
    /// cached artifacts.
    ///
    /// Returns the number of stages that were reset.
    pub fn expire_overdue_all(&self) -> usize {
        let purged = self.gateway.purge_expired_cache();
        if purged > 0 {
            debug!(purged, "Purged expired cached artifacts");
        }

        let campaigns: Vec<Arc<Campaign>> = self
            .campaigns
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        campaigns
            .iter()
            .map(|campaign| {
                let expired = campaign.expire_overdue();
                for (stage_id, err) in &expired {
                    warn!(campaign_id = %campaign.id(), stage_id = %stage_id, error = %err, "Expired abandoned derivation");
                }
                expired.len()
            })
            .sum()
    }

    /// Spawns a task that periodically times out abandoned derivations.
    ///
    /// The task stops once the registry is dropped.
    pub fn spawn_deadline_reaper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.expire_overdue_all();
            }
        })
    }
}
