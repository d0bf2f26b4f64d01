//! Persisted resource status.
//!
//! The status is only written through [`StatusUpdater::update`], which
//! re-reads and re-applies the change when another writer got there first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{OperatorError, OperatorResult};
use crate::types::{ObservedStatus, ResourceKey};

/// A status together with the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredStatus {
    /// The status.
    pub status: ObservedStatus,
    /// Revision for optimistic concurrency.
    pub revision: u64,
}

/// Storage for resource statuses.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Current status; `None` before the first write.
    async fn get(&self, key: &ResourceKey) -> OperatorResult<Option<StoredStatus>>;

    /// Replace the status if it is still at `expected_revision` (0 before the first write).
    ///
    /// Returns the new revision, or [`OperatorError::StatusConflict`].
    async fn update(
        &self,
        key: &ResourceKey,
        status: ObservedStatus,
        expected_revision: u64,
    ) -> OperatorResult<u64>;
}

/// Read-modify-write of resource statuses with bounded conflict retries.
#[derive(Clone)]
pub struct StatusUpdater {
    store: Arc<dyn StatusStore>,
    conflict_retries: u32,
}

impl StatusUpdater {
    /// Create a new updater retrying up to `conflict_retries` times after the first write.
    #[must_use]
    pub fn new(store: Arc<dyn StatusStore>, conflict_retries: u32) -> Self {
        Self {
            store,
            conflict_retries,
        }
    }

    /// Current status, or the default for a resource never reconciled.
    pub async fn current(&self, key: &ResourceKey) -> OperatorResult<ObservedStatus> {
        Ok(self
            .store
            .get(key)
            .await?
            .map(|s| s.status)
            .unwrap_or_default())
    }

    /// Apply `change` to the stored status and write it back.
    pub async fn update<F>(&self, key: &ResourceKey, mut change: F) -> OperatorResult<ObservedStatus>
    where
        F: FnMut(&mut ObservedStatus) + Send,
    {
        let mut attempt = 0;
        loop {
            let (mut status, revision) = match self.store.get(key).await? {
                Some(stored) => (stored.status, stored.revision),
                None => (ObservedStatus::default(), 0),
            };
            change(&mut status);

            match self.store.update(key, status.clone(), revision).await {
                Ok(revision) => {
                    debug!(resource = %key, revision, phase = %status.phase, "updated status");
                    return Ok(status);
                }
                Err(e @ OperatorError::StatusConflict { .. }) if attempt < self.conflict_retries => {
                    attempt += 1;
                    warn!(resource = %key, attempt, error = %e, "status changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Status store kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStatusStore {
    data: Arc<RwLock<HashMap<ResourceKey, StoredStatus>>>,
    pending_conflicts: Arc<AtomicU32>,
    writes: Arc<AtomicU64>,
}

impl MemoryStatusStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate `count` concurrent writers: the next `count` updates conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of successful writes.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get(&self, key: &ResourceKey) -> OperatorResult<Option<StoredStatus>> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn update(
        &self,
        key: &ResourceKey,
        status: ObservedStatus,
        expected_revision: u64,
    ) -> OperatorResult<u64> {
        let mut data = self.data.write().await;
        let current = data.get(key).map_or(0, |s| s.revision);

        let conflicts = self.pending_conflicts.load(Ordering::SeqCst);
        if conflicts > 0 {
            self.pending_conflicts.store(conflicts - 1, Ordering::SeqCst);
            // Another writer bumps the revision.
            let entry = data.entry(key.clone()).or_insert_with(|| StoredStatus {
                status: ObservedStatus::default(),
                revision: 0,
            });
            entry.revision += 1;
            return Err(OperatorError::StatusConflict {
                resource: key.to_string(),
                expected: expected_revision,
                actual: entry.revision,
            });
        }
        if current != expected_revision {
            return Err(OperatorError::StatusConflict {
                resource: key.to_string(),
                expected: expected_revision,
                actual: current,
            });
        }

        let revision = current + 1;
        data.insert(key.clone(), StoredStatus { status, revision });
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(revision)
    }
}
