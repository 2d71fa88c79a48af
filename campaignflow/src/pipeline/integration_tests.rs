//! End-to-end tests driving campaigns through the registry, gateway and
//! controller together.

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::audit::{AuditLog, AuditLogEntry, MockAuditLog};
    use crate::campaign::{Campaign, CampaignRegistry};
    use crate::config::{BusyPolicy, GatewayConfig, PipelineConfig};
    use crate::core::{AuditAction, StageStatus};
    use crate::errors::{AuditLogError, CampaignflowError, DerivationError};
    use crate::gateway::{DerivationEngine, EngineFailure, RetryConfig};
    use crate::registry::{StageRegistry, CAMPAIGN_STAGES};
    use crate::testing::{sample_input, EchoEngine, ScriptedEngine, StalledEngine};

    fn registry_with(engine: Arc<dyn DerivationEngine>, config: PipelineConfig) -> CampaignRegistry {
        CampaignRegistry::new(
            Arc::new(StageRegistry::campaign_default().unwrap()),
            engine,
            config,
        )
    }

    fn no_retry() -> PipelineConfig {
        PipelineConfig::default().with_gateway(GatewayConfig::new().with_retry(RetryConfig::disabled()))
    }

    async fn advance(campaign: &Campaign, stage: &str) {
        campaign.submit_input(stage, sample_input(stage)).unwrap();
        campaign.derive(stage).await.unwrap();
        campaign.lock(stage).unwrap();
    }

    fn audit_pairs(entries: &[AuditLogEntry]) -> Vec<(String, AuditAction)> {
        entries
            .iter()
            .map(|e| (e.stage_id.clone(), e.action))
            .collect()
    }

    async fn wait_in_flight(registry: &CampaignRegistry, campaign: &Campaign, stage: &str) {
        while !registry.gateway().is_in_flight(campaign.id(), stage) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_happy_path_scenario() {
        let registry = registry_with(Arc::new(EchoEngine::new()), PipelineConfig::default());
        let campaign = registry.create("Spring win-back").unwrap();

        campaign.submit_input("context", sample_input("context")).unwrap();
        let artifact = campaign.derive("context").await.unwrap();
        assert_eq!(artifact.stage_id, "context");
        assert!(artifact.input_hash.is_some());
        campaign.lock("context").unwrap();
        assert_eq!(campaign.current_stage_id().as_deref(), Some("segment"));

        for stage in &CAMPAIGN_STAGES[1..] {
            assert_eq!(campaign.current_stage_id().as_deref(), Some(*stage));
            advance(&campaign, stage).await;
            campaign.check_invariants().unwrap();
        }

        assert_eq!(campaign.status("review").unwrap(), StageStatus::Locked);
        assert!(campaign.is_complete());
        let expected: Vec<(String, AuditAction)> = CAMPAIGN_STAGES
            .iter()
            .map(|s| ((*s).to_string(), AuditAction::Locked))
            .collect();
        let history = campaign.audit_history();
        assert_eq!(audit_pairs(&history), expected);
        assert_eq!(
            history.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            (0..6).collect::<Vec<u64>>()
        );
    }

    #[tokio::test]
    async fn test_edit_cascade_scenario() {
        let registry = registry_with(Arc::new(EchoEngine::new()), PipelineConfig::default());
        let campaign = registry.create("Cascade").unwrap();
        for stage in CAMPAIGN_STAGES {
            advance(&campaign, stage).await;
        }

        let report = campaign.unlock("context").unwrap();

        assert_eq!(report.invalidated.len(), 5);
        for stage in &CAMPAIGN_STAGES[1..] {
            assert_eq!(campaign.status(stage).unwrap(), StageStatus::NotStarted);
            assert!(campaign.record(stage).unwrap().is_none());
        }
        // Context awaits review again; the cursor moves on once it is re-locked.
        assert_eq!(campaign.current_stage_id().as_deref(), Some("context"));
        campaign.lock("context").unwrap();
        assert_eq!(campaign.current_stage_id().as_deref(), Some("segment"));

        let invalidations = campaign
            .audit_history()
            .into_iter()
            .filter(|e| e.action == AuditAction::Invalidated)
            .count();
        assert_eq!(invalidations, 5);
        campaign.check_invariants().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_scenario() {
        let config = no_retry().with_derive_timeout(Duration::from_millis(800));
        let registry = registry_with(Arc::new(StalledEngine::new()), config);
        let campaign = registry.create("Stalled").unwrap();
        campaign.submit_input("context", sample_input("context")).unwrap();

        let err = campaign.derive("context").await.unwrap_err();

        assert!(matches!(
            err,
            CampaignflowError::Derivation(DerivationError::Timeout { timeout_ms: 800, .. })
        ));
        let record = campaign.record("context").unwrap().unwrap();
        assert_eq!(record.status, StageStatus::InputCaptured);
        assert_eq!(record.input, Some(sample_input("context")));
        assert!(record.last_error.unwrap().contains("timed out"));
        assert_eq!(registry.gateway().in_flight_count(), 0);
        campaign.check_invariants().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_derivation_is_reaped() {
        let config = no_retry().with_derive_timeout(Duration::from_secs(2));
        let registry = Arc::new(registry_with(Arc::new(StalledEngine::new()), config));
        let campaign = registry.create("Abandoned").unwrap();
        campaign.submit_input("context", sample_input("context")).unwrap();

        let task = {
            let campaign = campaign.clone();
            tokio::spawn(async move { campaign.derive("context").await })
        };
        wait_in_flight(&registry, &campaign, "context").await;
        task.abort();
        let _ = task.await;
        assert_eq!(campaign.status("context").unwrap(), StageStatus::Deriving);

        let reaper = registry.spawn_deadline_reaper(Duration::from_millis(250));
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(campaign.status("context").unwrap(), StageStatus::InputCaptured);
        assert_eq!(
            campaign.record("context").unwrap().unwrap().input,
            Some(sample_input("context"))
        );
        reaper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaped_live_derivation_reports_timeout() {
        let config = no_retry().with_derive_timeout(Duration::from_secs(1));
        let registry = registry_with(Arc::new(StalledEngine::new()), config);
        let campaign = registry.create("Reaped").unwrap();
        campaign.submit_input("context", sample_input("context")).unwrap();

        let task = {
            let campaign = campaign.clone();
            tokio::spawn(async move { campaign.derive("context").await })
        };
        wait_in_flight(&registry, &campaign, "context").await;

        tokio::time::advance(Duration::from_millis(1_001)).await;
        registry.expire_overdue_all();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            CampaignflowError::Derivation(DerivationError::Timeout { timeout_ms: 1_000, .. })
        ));
        assert_eq!(campaign.status("context").unwrap(), StageStatus::InputCaptured);
        assert_eq!(registry.gateway().in_flight_count(), 0);
        campaign.check_invariants().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resubmitted_input_cancels_derivation_started_on_another_thread() {
        let mut replacement = sample_input("context");
        replacement["goal"] = serde_json::json!("Reactivate dormant loyalty members");

        for _ in 0..20 {
            let config = no_retry().with_derive_timeout(Duration::from_millis(300));
            let registry = registry_with(Arc::new(StalledEngine::new()), config);
            let campaign = registry.create("Race").unwrap();
            campaign.submit_input("context", sample_input("context")).unwrap();

            let deriving = {
                let campaign = campaign.clone();
                tokio::spawn(async move { campaign.derive("context").await })
            };
            let resubmitting = {
                let campaign = campaign.clone();
                let input = replacement.clone();
                tokio::spawn(async move { campaign.submit_input("context", input) })
            };
            let derived = deriving.await.unwrap();
            resubmitting.await.unwrap().unwrap();

            let record = campaign.record("context").unwrap().unwrap();
            assert_eq!(record.status, StageStatus::InputCaptured);
            assert_eq!(record.input, Some(replacement.clone()));
            match derived {
                // The new input superseded a running derivation.
                Err(CampaignflowError::Derivation(DerivationError::Cancelled { .. })) => {
                    assert!(record.last_error.is_none());
                }
                // The derivation ran on the new input and hit its deadline.
                Err(CampaignflowError::Derivation(DerivationError::Timeout { .. })) => {
                    assert!(record.last_error.is_some());
                }
                other => panic!("unexpected derive outcome: {other:?}"),
            }
            assert_eq!(registry.gateway().in_flight_count(), 0);
            assert_eq!(registry.gateway().cached_count(), 0);
            campaign.check_invariants().unwrap();
        }
    }

    #[tokio::test]
    async fn test_idempotent_retry_after_failure() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push_failure(EngineFailure::permanent("brand voice model offline"));
        let registry = registry_with(engine.clone(), no_retry());
        let campaign = registry.create("Retry").unwrap();
        campaign.submit_input("context", sample_input("context")).unwrap();

        let err = campaign.derive("context").await.unwrap_err();
        assert!(matches!(
            err,
            CampaignflowError::Derivation(DerivationError::Failed { .. })
        ));
        assert_eq!(campaign.status("context").unwrap(), StageStatus::InputCaptured);

        let first = campaign.derive("context").await.unwrap();
        campaign.request_edit("context").unwrap();
        let second = campaign.derive("context").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(engine.call_count(), 2);
        assert!(campaign.audit_history().is_empty());

        campaign.lock("context").unwrap();
        assert_eq!(campaign.audit_history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push_failure(EngineFailure::transient("429 too many requests"));
        let registry = registry_with(engine.clone(), PipelineConfig::default());
        let campaign = registry.create("Transient").unwrap();
        campaign.submit_input("context", sample_input("context")).unwrap();

        campaign.derive("context").await.unwrap();

        assert_eq!(engine.call_count(), 2);
        assert_eq!(campaign.status("context").unwrap(), StageStatus::PendingReview);
    }

    #[tokio::test]
    async fn test_new_input_supersedes_in_flight_derivation() {
        let registry = registry_with(Arc::new(StalledEngine::for_stages(&["context"])), no_retry());
        let campaign = registry.create("Supersede").unwrap();
        campaign.submit_input("context", sample_input("context")).unwrap();

        let task = {
            let campaign = campaign.clone();
            tokio::spawn(async move { campaign.derive("context").await })
        };
        wait_in_flight(&registry, &campaign, "context").await;

        let revised = serde_json::json!({"goal": "Grow repeat purchases", "brand": "Acme Outdoor"});
        campaign.submit_input("context", revised.clone()).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            CampaignflowError::Derivation(DerivationError::Cancelled { .. })
        ));
        let record = campaign.record("context").unwrap().unwrap();
        assert_eq!(record.status, StageStatus::InputCaptured);
        assert_eq!(record.input, Some(revised));
        assert!(record.artifact.is_none());
    }

    #[tokio::test]
    async fn test_unlock_discards_downstream_derivation() {
        let registry = registry_with(Arc::new(StalledEngine::for_stages(&["segment"])), no_retry());
        let campaign = registry.create("Invalidate").unwrap();
        advance(&campaign, "context").await;
        campaign.submit_input("segment", sample_input("segment")).unwrap();

        let task = {
            let campaign = campaign.clone();
            tokio::spawn(async move { campaign.derive("segment").await })
        };
        wait_in_flight(&registry, &campaign, "segment").await;

        let report = campaign.unlock("context").unwrap();
        assert_eq!(report.invalidated, vec!["segment"]);
        assert_eq!(report.cancelled_requests.len(), 1);

        assert!(task.await.unwrap().is_err());
        assert_eq!(campaign.status("segment").unwrap(), StageStatus::NotStarted);
        assert_eq!(campaign.status("context").unwrap(), StageStatus::PendingReview);
        campaign.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_derive_keeps_input() {
        let registry = registry_with(Arc::new(StalledEngine::new()), no_retry());
        let campaign = registry.create("Cancel").unwrap();
        campaign.submit_input("context", sample_input("context")).unwrap();

        let task = {
            let campaign = campaign.clone();
            tokio::spawn(async move { campaign.derive("context").await })
        };
        wait_in_flight(&registry, &campaign, "context").await;
        campaign.cancel_derive("context").unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(CampaignflowError::Derivation(DerivationError::Cancelled { .. }))
        ));
        assert_eq!(campaign.status("context").unwrap(), StageStatus::InputCaptured);
    }

    #[tokio::test]
    async fn test_second_derive_on_same_stage_is_refused() {
        let config = no_retry()
            .with_gateway(GatewayConfig::new().with_busy_policy(BusyPolicy::Reject));
        let registry = registry_with(Arc::new(StalledEngine::new()), config);
        let a = registry.create("A").unwrap();
        a.submit_input("context", sample_input("context")).unwrap();

        let task = {
            let a = a.clone();
            tokio::spawn(async move { a.derive("context").await })
        };
        wait_in_flight(&registry, &a, "context").await;

        // A second derive on the same stage is blocked by the controller first.
        let err = a.derive("context").await.unwrap_err();
        assert!(matches!(err, CampaignflowError::Precondition(_)));

        // A different campaign's stage is independent.
        let b = registry.create("B").unwrap();
        b.submit_input("context", sample_input("context")).unwrap();
        let b_task = {
            let b = b.clone();
            tokio::spawn(async move { b.derive("context").await })
        };
        wait_in_flight(&registry, &b, "context").await;
        assert_eq!(registry.gateway().in_flight_count(), 2);

        registry.delete(a.id()).unwrap();
        registry.delete(b.id()).unwrap();
        assert!(task.await.unwrap().is_err());
        assert!(b_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_transitions_keep_ordering_invariant() {
        let registry = registry_with(Arc::new(EchoEngine::new()), PipelineConfig::default());
        let campaign = registry.create("Concurrent").unwrap();
        for stage in CAMPAIGN_STAGES {
            advance(&campaign, stage).await;
        }

        let mut tasks = Vec::new();
        for round in 0..8 {
            let campaign = campaign.clone();
            tasks.push(tokio::spawn(async move {
                let stage = CAMPAIGN_STAGES[round % 3];
                for _ in 0..5 {
                    let _ = campaign.unlock(stage);
                    campaign.check_invariants().unwrap();
                    let _ = campaign.lock(stage);
                    for downstream in &CAMPAIGN_STAGES[1..] {
                        let _ = campaign.submit_input(downstream, sample_input(downstream));
                        let _ = campaign.derive(downstream).await;
                        let _ = campaign.lock(downstream);
                        campaign.check_invariants().unwrap();
                    }
                }
            }));
        }
        for task in futures::future::join_all(tasks).await {
            task.unwrap();
        }

        campaign.check_invariants().unwrap();
        let summary = campaign.summary();
        assert_eq!(
            summary.current_stage.as_deref(),
            CAMPAIGN_STAGES
                .iter()
                .copied()
                .find(|s| campaign.status(s).unwrap() != StageStatus::Locked)
        );
    }

    #[tokio::test]
    async fn test_audit_fault_surfaces_and_preserves_state() {
        let mut audit = MockAuditLog::new();
        audit
            .expect_append()
            .returning(|_| Err(AuditLogError::Storage("write rejected".to_string())));
        audit.expect_entries_for().returning(|_| Vec::new());
        let registry = registry_with(Arc::new(EchoEngine::new()), PipelineConfig::default())
            .with_audit_log(Arc::new(audit) as Arc<dyn AuditLog>);
        let campaign = registry.create("Faulty storage").unwrap();
        campaign.submit_input("context", sample_input("context")).unwrap();
        campaign.derive("context").await.unwrap();

        let err = campaign.lock("context").unwrap_err();

        assert_eq!(err.code(), "AUDIT-STORAGE");
        assert!(!err.is_recoverable());
        assert_eq!(campaign.status("context").unwrap(), StageStatus::PendingReview);
        assert!(campaign.audit_history().is_empty());
    }
}
