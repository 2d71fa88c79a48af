//! Idempotency cache for derived artifacts.
//!
//! A retry of an identical request (same campaign, stage, input and
//! upstream artifacts) returns the artifact already derived instead of
//! calling the engine again.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::DerivationRequest;
use crate::cancellation::CancellationToken;
use crate::core::DerivedArtifact;
use crate::utils::{hash_input, idempotency_key};

/// A cached artifact with its expiry.
#[derive(Debug, Clone)]
struct CachedArtifact {
    artifact: DerivedArtifact,
    campaign_id: Uuid,
    expires_at: Option<Instant>,
}

impl CachedArtifact {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-memory artifact cache keyed by request fingerprint.
#[derive(Debug, Default)]
pub struct ArtifactCache {
    ttl: Option<Duration>,
    entries: Mutex<HashMap<String, CachedArtifact>>,
}

impl ArtifactCache {
    /// Creates a cache whose entries live for `ttl` (forever if `None`).
    #[must_use]
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Computes the idempotency key of a request.
    ///
    /// The request id and generation are excluded: they differ on every retry.
    #[must_use]
    pub fn key_for(request: &DerivationRequest) -> String {
        let upstream: Vec<String> = request
            .upstream
            .iter()
            .map(|(stage, artifact)| format!("{stage}={}", artifact.id))
            .collect();
        let input_hash = hash_input(&request.input);
        let campaign = request.campaign_id.to_string();
        let upstream = upstream.join(",");
        idempotency_key(&[&campaign, &request.stage_id, &input_hash, &upstream])
    }

    /// Returns the cached artifact for `key`, dropping it if expired.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<DerivedArtifact> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            if entry.is_expired(Instant::now()) {
                entries.remove(key);
                return None;
            }
            return Some(entry.artifact.clone());
        }
        None
    }

    /// Stores an artifact, evicting every expired entry.
    pub fn insert(&self, key: String, campaign_id: Uuid, artifact: DerivedArtifact) {
        let mut entries = self.entries.lock();
        self.store(&mut entries, key, campaign_id, artifact);
    }

    /// Stores an artifact unless `token` has fired.
    ///
    /// The check and the write happen under the cache lock, so a campaign
    /// cancelled before [`forget_campaign`](Self::forget_campaign) never gets
    /// an entry back. Returns false if nothing was stored.
    pub fn insert_unless_cancelled(
        &self,
        key: String,
        campaign_id: Uuid,
        artifact: DerivedArtifact,
        token: &CancellationToken,
    ) -> bool {
        let mut entries = self.entries.lock();
        if token.is_cancelled() {
            return false;
        }
        self.store(&mut entries, key, campaign_id, artifact);
        true
    }

    /// Drops every expired entry. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    fn store(
        &self,
        entries: &mut HashMap<String, CachedArtifact>,
        key: String,
        campaign_id: Uuid,
        artifact: DerivedArtifact,
    ) {
        let now = Instant::now();
        if self.ttl.is_some() {
            entries.retain(|_, entry| !entry.is_expired(now));
        }
        entries.insert(
            key,
            CachedArtifact {
                artifact,
                campaign_id,
                expires_at: self.ttl.map(|ttl| now + ttl),
            },
        );
    }

    /// Drops every entry belonging to a campaign.
    pub fn forget_campaign(&self, campaign_id: Uuid) {
        self.entries
            .lock()
            .retain(|_, entry| entry.campaign_id != campaign_id);
    }

    /// Returns the number of entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
