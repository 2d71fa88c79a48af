//! Append-only audit log of lock, unlock and invalidation events.
//!
//! The pipeline writes to the log before it mutates any state, so a storage
//! fault leaves the campaign untouched. The pipeline never reads the log back.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use uuid::Uuid;

use crate::core::AuditAction;
use crate::errors::AuditLogError;
use crate::utils::{now_utc, Timestamp};

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Campaign the entry belongs to.
    pub campaign_id: Uuid,
    /// Stage the action applied to.
    pub stage_id: String,
    /// What happened.
    pub action: AuditAction,
    /// When it happened.
    pub timestamp: Timestamp,
    /// Position within the campaign's history, assigned by the log.
    pub sequence: u64,
}

impl AuditLogEntry {
    /// Creates an entry stamped with the current time. The sequence is
    /// assigned when the entry is appended.
    #[must_use]
    pub fn new(campaign_id: Uuid, stage_id: impl Into<String>, action: AuditAction) -> Self {
        Self {
            campaign_id,
            stage_id: stage_id.into(),
            action,
            timestamp: now_utc(),
            sequence: 0,
        }
    }
}

/// Storage for audit entries, shared by every campaign.
#[cfg_attr(test, mockall::automock)]
pub trait AuditLog: Send + Sync + Debug {
    /// Appends one entry.
    ///
    /// # Errors
    ///
    /// Returns `AuditLogError::Storage` if the backing store rejects the write.
    fn append(&self, entry: AuditLogEntry) -> Result<(), AuditLogError>;

    /// Appends several entries. Either all are stored or none are.
    ///
    /// # Errors
    ///
    /// Returns `AuditLogError::Storage` if the backing store rejects the write.
    fn append_all(&self, entries: Vec<AuditLogEntry>) -> Result<(), AuditLogError>;

    /// Returns a campaign's entries in the order they were appended.
    fn entries_for(&self, campaign_id: Uuid) -> Vec<AuditLogEntry>;

    /// Drops a campaign's history. Only used when the campaign is deleted.
    fn discard(&self, campaign_id: Uuid);
}

/// Process-local audit log.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<HashMap<Uuid, Vec<AuditLogEntry>>>,
}

impl InMemoryAuditLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of entries across campaigns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    /// Returns true if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditLog for InMemoryAuditLog {
    fn append(&self, entry: AuditLogEntry) -> Result<(), AuditLogError> {
        self.append_all(vec![entry])
    }

    fn append_all(&self, entries: Vec<AuditLogEntry>) -> Result<(), AuditLogError> {
        let mut store = self.entries.write();
        for mut entry in entries {
            let history = store.entry(entry.campaign_id).or_default();
            entry.sequence = history.len() as u64;
            history.push(entry);
        }
        Ok(())
    }

    fn entries_for(&self, campaign_id: Uuid) -> Vec<AuditLogEntry> {
        self.entries
            .read()
            .get(&campaign_id)
            .cloned()
            .unwrap_or_default()
    }

    fn discard(&self, campaign_id: Uuid) {
        self.entries.write().remove(&campaign_id);
    }
}
