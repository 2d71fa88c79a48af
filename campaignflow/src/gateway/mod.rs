//! The derivation gateway.
//!
//! Wraps a [`DerivationEngine`] with the guarantees the pipeline relies on:
//! - at most one request in flight per `(campaign, stage)`, superseding or
//!   rejecting a second one according to [`BusyPolicy`]
//! - cooperative cancellation by request id or by campaign
//! - bounded retry of transient engine failures
//! - an idempotency cache so an identical retry never re-runs the engine

mod cache;
mod engine;
mod retry;

pub use cache::ArtifactCache;
pub use engine::{DerivationEngine, DerivationRequest, EngineFailure};
pub use retry::{BackoffStrategy, JitterStrategy, RetryConfig};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::config::{BusyPolicy, GatewayConfig};
use crate::core::DerivedArtifact;
use crate::errors::DerivationError;
use crate::utils::hash_input;

type InFlightKey = (Uuid, String);

#[derive(Debug)]
struct InFlight {
    request_id: Uuid,
    token: Arc<CancellationToken>,
}

/// Removes a request's in-flight slot when its future finishes or is dropped.
struct InFlightGuard<'a> {
    map: &'a DashMap<InFlightKey, InFlight>,
    key: InFlightKey,
    request_id: Uuid,
    token: Arc<CancellationToken>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let removed = self
            .map
            .remove_if(&self.key, |_, slot| slot.request_id == self.request_id);
        if removed.is_some() {
            // A dropped future (e.g. a caller-side deadline) still tells the
            // engine to stop.
            self.token.cancel("request finished or abandoned");
        }
    }
}

enum Pending<'a> {
    Cached(DerivedArtifact),
    Registered {
        cache_key: String,
        guard: InFlightGuard<'a>,
    },
}

/// A request registered with the gateway, ready to run.
///
/// Dropping it without running releases its slot and cancels it.
#[must_use = "a prepared derivation does nothing until it is run"]
pub struct PendingDerivation<'a> {
    gateway: &'a DerivationGateway,
    request: DerivationRequest,
    state: Pending<'a>,
}

impl PendingDerivation<'_> {
    /// Returns the request id.
    #[must_use]
    pub fn request_id(&self) -> Uuid {
        self.request.request_id
    }

    /// Runs the engine, with retries, until it succeeds, fails or is cancelled.
    ///
    /// # Errors
    ///
    /// See [`DerivationGateway::derive`].
    pub async fn run(self) -> Result<DerivedArtifact, DerivationError> {
        let Self {
            gateway,
            request,
            state,
        } = self;
        match state {
            Pending::Cached(artifact) => Ok(artifact),
            Pending::Registered { cache_key, guard } => {
                let token = guard.token.clone();
                let result = gateway.execute(&request, cache_key, &token).await;
                drop(guard);
                result
            }
        }
    }
}

impl std::fmt::Debug for PendingDerivation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingDerivation")
            .field("request_id", &self.request.request_id)
            .field("stage_id", &self.request.stage_id)
            .field("cached", &matches!(self.state, Pending::Cached(_)))
            .finish()
    }
}

/// Uniform entry point to the derivation engine.
#[derive(Debug)]
pub struct DerivationGateway {
    engine: Arc<dyn DerivationEngine>,
    config: GatewayConfig,
    in_flight: DashMap<InFlightKey, InFlight>,
    cache: ArtifactCache,
}

impl DerivationGateway {
    /// Creates a gateway around an engine.
    #[must_use]
    pub fn new(engine: Arc<dyn DerivationEngine>, config: GatewayConfig) -> Self {
        let cache = ArtifactCache::new(config.cache_ttl());
        Self {
            engine,
            config,
            in_flight: DashMap::new(),
            cache,
        }
    }

    /// Returns the gateway configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Derives an artifact for the request.
    ///
    /// Shorthand for [`prepare`](Self::prepare) followed by
    /// [`PendingDerivation::run`].
    ///
    /// # Errors
    ///
    /// - `DerivationError::Busy` if another request for the same stage is in
    ///   flight and the policy is [`BusyPolicy::Reject`]
    /// - `DerivationError::Cancelled` if the request was cancelled or
    ///   superseded before it completed
    /// - `DerivationError::Failed` if the engine failed permanently or ran
    ///   out of retries
    pub async fn derive(
        &self,
        request: DerivationRequest,
    ) -> Result<DerivedArtifact, DerivationError> {
        self.prepare(request)?.run().await
    }

    /// Registers a request without running it.
    ///
    /// From this point the request can be cancelled by id, superseded or
    /// cancelled with its campaign, even before [`PendingDerivation::run`]
    /// is first polled.
    ///
    /// # Errors
    ///
    /// `DerivationError::Busy` under [`BusyPolicy::Reject`] when the stage
    /// already has a request in flight.
    pub fn prepare(
        &self,
        request: DerivationRequest,
    ) -> Result<PendingDerivation<'_>, DerivationError> {
        let cache_key = ArtifactCache::key_for(&request);
        if let Some(artifact) = self.cache.get(&cache_key) {
            debug!(
                campaign_id = %request.campaign_id,
                stage_id = %request.stage_id,
                request_id = %request.request_id,
                "Returning cached artifact"
            );
            return Ok(PendingDerivation {
                gateway: self,
                request,
                state: Pending::Cached(artifact),
            });
        }

        let guard = self.register(&request, Arc::new(CancellationToken::new()))?;
        Ok(PendingDerivation {
            gateway: self,
            request,
            state: Pending::Registered { cache_key, guard },
        })
    }

    async fn execute(
        &self,
        request: &DerivationRequest,
        cache_key: String,
        token: &CancellationToken,
    ) -> Result<DerivedArtifact, DerivationError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                () = token.cancelled() => {
                    return Err(self.cancelled_error(request, token));
                }
                outcome = self.engine.derive(request, token) => outcome,
            };

            if token.is_cancelled() {
                return Err(self.cancelled_error(request, token));
            }

            match outcome {
                Ok(artifact) => {
                    if artifact.stage_id != request.stage_id {
                        return Err(DerivationError::failed(
                            &request.stage_id,
                            format!(
                                "engine returned an artifact for stage '{}'",
                                artifact.stage_id
                            ),
                        ));
                    }
                    let artifact = artifact.with_input_hash(hash_input(&request.input));
                    if !self.cache.insert_unless_cancelled(
                        cache_key,
                        request.campaign_id,
                        artifact.clone(),
                        token,
                    ) {
                        return Err(self.cancelled_error(request, token));
                    }
                    info!(
                        campaign_id = %request.campaign_id,
                        stage_id = %request.stage_id,
                        request_id = %request.request_id,
                        attempt,
                        "Derivation succeeded"
                    );
                    return Ok(artifact);
                }
                Err(failure) if failure.transient && self.config.retry.allows_retry(attempt) => {
                    let delay = self.config.retry.delay_for(attempt - 1);
                    warn!(
                        campaign_id = %request.campaign_id,
                        stage_id = %request.stage_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %failure,
                        "Transient derivation failure, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = token.cancelled() => {
                            return Err(self.cancelled_error(request, token));
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(failure) => {
                    warn!(
                        campaign_id = %request.campaign_id,
                        stage_id = %request.stage_id,
                        attempt,
                        error = %failure,
                        "Derivation failed"
                    );
                    return Err(DerivationError::failed(&request.stage_id, failure.reason));
                }
            }
        }
    }

    /// Cancels an in-flight request. Returns false if it is not in flight.
    pub fn cancel(&self, request_id: Uuid, reason: &str) -> bool {
        for slot in &self.in_flight {
            if slot.request_id == request_id {
                slot.token.cancel(reason);
                debug!(%request_id, reason, "Cancelled derivation request");
                return true;
            }
        }
        false
    }

    /// Cancels every in-flight request of a campaign. Returns how many were cancelled.
    pub fn cancel_campaign(&self, campaign_id: Uuid, reason: &str) -> usize {
        let mut cancelled = 0;
        for slot in &self.in_flight {
            if slot.key().0 == campaign_id {
                slot.token.cancel(reason);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Drops a campaign's cached artifacts.
    pub fn forget_campaign(&self, campaign_id: Uuid) {
        self.cache.forget_campaign(campaign_id);
    }

    /// Returns true if a request is in flight for the stage.
    #[must_use]
    pub fn is_in_flight(&self, campaign_id: Uuid, stage_id: &str) -> bool {
        self.in_flight
            .contains_key(&(campaign_id, stage_id.to_string()))
    }

    /// Returns the number of in-flight requests.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Returns the number of cached artifacts.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Drops expired cache entries. Returns how many were dropped.
    pub fn purge_expired_cache(&self) -> usize {
        self.cache.purge_expired()
    }

    fn register(
        &self,
        request: &DerivationRequest,
        token: Arc<CancellationToken>,
    ) -> Result<InFlightGuard<'_>, DerivationError> {
        let key = (request.campaign_id, request.stage_id.clone());
        let slot = InFlight {
            request_id: request.request_id,
            token: token.clone(),
        };

        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match self.config.busy_policy {
                BusyPolicy::Reject => {
                    return Err(DerivationError::busy(request.campaign_id, &request.stage_id));
                }
                BusyPolicy::Supersede => {
                    let previous = occupied.get();
                    previous
                        .token
                        .cancel(format!("superseded by request {}", request.request_id));
                    debug!(
                        stage_id = %request.stage_id,
                        previous = %previous.request_id,
                        next = %request.request_id,
                        "Superseding in-flight derivation"
                    );
                    occupied.insert(slot);
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
            }
        }

        Ok(InFlightGuard {
            map: &self.in_flight,
            key,
            request_id: request.request_id,
            token,
        })
    }

    fn cancelled_error(
        &self,
        request: &DerivationRequest,
        token: &CancellationToken,
    ) -> DerivationError {
        let reason = token.reason().unwrap_or_else(|| "cancelled".to_string());
        debug!(
            campaign_id = %request.campaign_id,
            stage_id = %request.stage_id,
            request_id = %request.request_id,
            reason = %reason,
            "Discarding cancelled derivation"
        );
        DerivationError::cancelled(request.request_id, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EchoEngine, ScriptedEngine, StalledEngine};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn request(campaign_id: Uuid, stage_id: &str, input: serde_json::Value) -> DerivationRequest {
        DerivationRequest {
            request_id: Uuid::now_v7(),
            campaign_id,
            stage_id: stage_id.to_string(),
            artifact_kind: stage_id.to_string(),
            input,
            upstream: BTreeMap::new(),
            generation: 1,
        }
    }

    fn no_retry() -> GatewayConfig {
        GatewayConfig::new().with_retry(RetryConfig::disabled())
    }

    #[tokio::test]
    async fn test_derive_success_stamps_input_hash() {
        let gateway = DerivationGateway::new(Arc::new(EchoEngine::new()), no_retry());
        let input = serde_json::json!({"goal": "retain"});

        let artifact = gateway
            .derive(request(Uuid::new_v4(), "context", input.clone()))
            .await
            .unwrap();

        assert_eq!(artifact.stage_id, "context");
        assert_eq!(artifact.input_hash, Some(hash_input(&input)));
        assert_eq!(gateway.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_identical_retry_hits_cache() {
        let engine = Arc::new(EchoEngine::new());
        let gateway = DerivationGateway::new(engine.clone(), no_retry());
        let campaign = Uuid::new_v4();

        let first = gateway
            .derive(request(campaign, "context", serde_json::json!({"goal": "a"})))
            .await
            .unwrap();
        let second = gateway
            .derive(request(campaign, "context", serde_json::json!({"goal": "a"})))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push_failure(EngineFailure::permanent("brand unknown"));
        let gateway = DerivationGateway::new(engine.clone(), GatewayConfig::new());

        let err = gateway
            .derive(request(Uuid::new_v4(), "context", serde_json::json!({})))
            .await
            .unwrap_err();

        assert_eq!(err, DerivationError::failed("context", "brand unknown"));
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried() {
        let engine = Arc::new(ScriptedEngine::new());
        engine.push_failure(EngineFailure::transient("rate limited"));
        engine.push_failure(EngineFailure::transient("rate limited"));
        let config = GatewayConfig::new().with_retry(
            RetryConfig::new()
                .with_max_attempts(3)
                .with_jitter(JitterStrategy::None),
        );
        let gateway = DerivationGateway::new(engine.clone(), config);

        let artifact = gateway
            .derive(request(Uuid::new_v4(), "segment", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(artifact.stage_id, "segment");
        assert_eq!(engine.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_exhausts_retries() {
        let engine = Arc::new(ScriptedEngine::new());
        for _ in 0..3 {
            engine.push_failure(EngineFailure::transient("upstream 503"));
        }
        let config = GatewayConfig::new().with_retry(RetryConfig::new().with_max_attempts(2));
        let gateway = DerivationGateway::new(engine.clone(), config);

        let err = gateway
            .derive(request(Uuid::new_v4(), "segment", serde_json::json!({})))
            .await
            .unwrap_err();

        assert!(matches!(err, DerivationError::Failed { .. }));
        assert_eq!(engine.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cancel_by_request_id() {
        let gateway = Arc::new(DerivationGateway::new(Arc::new(StalledEngine::new()), no_retry()));
        let campaign = Uuid::new_v4();
        let req = request(campaign, "context", serde_json::json!({}));
        let request_id = req.request_id;

        let task = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.derive(req).await })
        };
        while !gateway.is_in_flight(campaign, "context") {
            tokio::task::yield_now().await;
        }

        assert!(gateway.cancel(request_id, "user left the screen"));
        let err = task.await.unwrap().unwrap_err();

        assert_eq!(
            err,
            DerivationError::cancelled(request_id, "user left the screen")
        );
        assert!(!gateway.is_in_flight(campaign, "context"));
        assert_eq!(gateway.cached_count(), 0);
    }

    #[tokio::test]
    async fn test_supersede_cancels_previous() {
        let gateway = Arc::new(DerivationGateway::new(Arc::new(StalledEngine::new()), no_retry()));
        let campaign = Uuid::new_v4();
        let first = request(campaign, "context", serde_json::json!({"v": 1}));
        let first_id = first.request_id;

        let first_task = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.derive(first).await })
        };
        while !gateway.is_in_flight(campaign, "context") {
            tokio::task::yield_now().await;
        }

        let second = request(campaign, "context", serde_json::json!({"v": 2}));
        let second_id = second.request_id;
        let second_task = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.derive(second).await })
        };

        let err = first_task.await.unwrap().unwrap_err();
        assert!(matches!(err, DerivationError::Cancelled { request_id, .. } if request_id == first_id));

        // The slot now belongs to the second request.
        assert!(gateway.cancel(second_id, "done"));
        assert!(second_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_reject_policy_returns_busy() {
        let config = no_retry().with_busy_policy(BusyPolicy::Reject);
        let gateway = Arc::new(DerivationGateway::new(Arc::new(StalledEngine::new()), config));
        let campaign = Uuid::new_v4();
        let first = request(campaign, "context", serde_json::json!({}));
        let first_id = first.request_id;

        let task = {
            let gateway = gateway.clone();
            tokio::spawn(async move { gateway.derive(first).await })
        };
        while !gateway.is_in_flight(campaign, "context") {
            tokio::task::yield_now().await;
        }

        let err = gateway
            .derive(request(campaign, "context", serde_json::json!({"other": true})))
            .await
            .unwrap_err();
        assert_eq!(err, DerivationError::busy(campaign, "context"));

        gateway.cancel(first_id, "cleanup");
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_cancel_campaign() {
        let gateway = Arc::new(DerivationGateway::new(Arc::new(StalledEngine::new()), no_retry()));
        let campaign = Uuid::new_v4();

        let mut tasks = Vec::new();
        for stage in ["context", "segment"] {
            let gateway = gateway.clone();
            let req = request(campaign, stage, serde_json::json!({}));
            tasks.push(tokio::spawn(async move { gateway.derive(req).await }));
        }
        while gateway.in_flight_count() < 2 {
            tokio::task::yield_now().await;
        }

        assert_eq!(gateway.cancel_campaign(campaign, "campaign deleted"), 2);
        for task in futures::future::join_all(tasks).await {
            assert!(matches!(task.unwrap(), Err(DerivationError::Cancelled { .. })));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_future_releases_slot() {
        let gateway = DerivationGateway::new(Arc::new(StalledEngine::new()), no_retry());
        let campaign = Uuid::new_v4();

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            gateway.derive(request(campaign, "context", serde_json::json!({}))),
        )
        .await;

        assert!(result.is_err());
        assert!(!gateway.is_in_flight(campaign, "context"));
    }

    #[test]
    fn test_cancel_unknown_request() {
        let gateway = DerivationGateway::new(Arc::new(EchoEngine::new()), no_retry());
        assert!(!gateway.cancel(Uuid::new_v4(), "nothing"));
    }

    #[tokio::test]
    async fn test_prepared_request_is_cancellable_before_it_runs() {
        let engine = Arc::new(EchoEngine::new());
        let gateway = DerivationGateway::new(engine.clone(), no_retry());
        let campaign = Uuid::new_v4();

        let pending = gateway
            .prepare(request(campaign, "context", serde_json::json!({"goal": "a"})))
            .unwrap();
        let request_id = pending.request_id();
        assert!(gateway.is_in_flight(campaign, "context"));

        assert!(gateway.cancel(request_id, "superseded by new input"));
        let err = pending.run().await.unwrap_err();

        assert_eq!(
            err,
            DerivationError::cancelled(request_id, "superseded by new input")
        );
        assert_eq!(engine.call_count(), 0);
        assert_eq!(gateway.cached_count(), 0);
        assert_eq!(gateway.in_flight_count(), 0);
    }

    #[test]
    fn test_dropped_prepared_request_releases_slot() {
        let gateway = DerivationGateway::new(Arc::new(EchoEngine::new()), no_retry());
        let campaign = Uuid::new_v4();

        let pending = gateway
            .prepare(request(campaign, "context", serde_json::json!({})))
            .unwrap();
        drop(pending);

        assert!(!gateway.is_in_flight(campaign, "context"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_cache_entries_purged() {
        let config = no_retry().with_cache_ttl_seconds(Some(1.0));
        let gateway = DerivationGateway::new(Arc::new(EchoEngine::new()), config);
        let campaign = Uuid::new_v4();
        for stage in ["context", "segment"] {
            gateway
                .derive(request(campaign, stage, serde_json::json!({})))
                .await
                .unwrap();
        }
        assert_eq!(gateway.cached_count(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(gateway.purge_expired_cache(), 2);
        assert_eq!(gateway.cached_count(), 0);
    }
}
