//! In-memory work-item store for tests/dev.
//!
//! A single `RwLock` over the table makes every conditional update atomic,
//! which is the in-process equivalent of the row lock the PostgreSQL store
//! takes.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use workforge_core::{
    Claimability, Transition, WorkItem, WorkItemId, WorkItemUpdate, WorkerId, WorkItemStatus,
};

use super::store::{
    candidate_order, ClaimedRow, StoreError, WorkItemFilter, WorkItemStats, WorkItemStore,
};

#[derive(Debug, Default)]
pub struct InMemoryWorkItemStore {
    items: RwLock<HashMap<WorkItemId, WorkItem>>,
}

impl InMemoryWorkItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<WorkItemId, WorkItem>>, StoreError> {
        self.items
            .read()
            .map_err(|_| StoreError::Storage("work item table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<WorkItemId, WorkItem>>, StoreError> {
        self.items
            .write()
            .map_err(|_| StoreError::Storage("work item table lock poisoned".to_string()))
    }

    /// Run `f` against one row under the table write lock.
    fn with_item<R>(
        &self,
        id: WorkItemId,
        f: impl FnOnce(&mut WorkItem) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut items = self.write()?;
        let item = items.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        f(item)
    }
}

#[async_trait]
impl WorkItemStore for InMemoryWorkItemStore {
    async fn insert(&self, item: WorkItem) -> Result<WorkItemId, StoreError> {
        item.validate()?;
        let mut items = self.write()?;
        if items.contains_key(&item.id) {
            return Err(StoreError::AlreadyExists(item.id));
        }
        let id = item.id;
        items.insert(id, item);
        Ok(id)
    }

    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn update_definition(
        &self,
        id: WorkItemId,
        update: &WorkItemUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, StoreError> {
        self.with_item(id, |item| {
            item.apply_update(update, now)?;
            Ok(item.clone())
        })
    }

    async fn delete(&self, id: WorkItemId) -> Result<(), StoreError> {
        let mut items = self.write()?;
        match items.get(&id) {
            None => Err(StoreError::NotFound(id)),
            Some(item) if item.lock_owner.is_some() => Err(StoreError::Conflict(format!(
                "work item {id} is leased by {}",
                item.lock_owner.as_ref().map(WorkerId::as_str).unwrap_or_default()
            ))),
            Some(_) => {
                items.remove(&id);
                Ok(())
            }
        }
    }

    async fn set_enabled(
        &self,
        id: WorkItemId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, StoreError> {
        self.with_item(id, |item| {
            item.set_enabled(enabled, now);
            Ok(item.clone())
        })
    }

    async fn force_run(&self, id: WorkItemId, now: DateTime<Utc>) -> Result<WorkItem, StoreError> {
        self.with_item(id, |item| {
            item.force_run(now)?;
            Ok(item.clone())
        })
    }

    async fn find_candidates(
        &self,
        now: DateTime<Utc>,
        lease_duration: Duration,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.read()?;
        let mut candidates: Vec<_> = items
            .values()
            .filter(|i| i.claimability(now, lease_duration) != Claimability::NotClaimable)
            .cloned()
            .collect();
        candidates.sort_by(candidate_order);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn try_claim(
        &self,
        id: WorkItemId,
        worker: &WorkerId,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedRow>, StoreError> {
        self.with_item(id, |item| match item.claimability(now, lease_duration) {
            Claimability::NotClaimable => Ok(None),
            claimability => {
                let reclaimed_from = item.lease_to(worker, now, claimability)?;
                Ok(Some(ClaimedRow {
                    item: item.clone(),
                    reclaimed_from,
                }))
            }
        })
    }

    async fn mark_running(
        &self,
        id: WorkItemId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_item(id, |item| {
            if !item.is_locked_by(worker) || item.status != WorkItemStatus::Leased {
                return Ok(false);
            }
            item.status = WorkItemStatus::Running;
            item.updated_at = now;
            Ok(true)
        })
    }

    async fn renew(
        &self,
        id: WorkItemId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_item(id, |item| {
            if !item.is_locked_by(worker) {
                return Ok(false);
            }
            item.lock_acquired_at = Some(now);
            item.updated_at = now;
            Ok(true)
        })
    }

    async fn release(
        &self,
        id: WorkItemId,
        worker: &WorkerId,
        transition: &Transition,
    ) -> Result<bool, StoreError> {
        let mut items = self.write()?;
        match items.get_mut(&id) {
            Some(item) if item.is_locked_by(worker) => {
                item.release(transition);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_unarmed(&self, limit: usize) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.read()?;
        let mut unarmed: Vec<_> = items.values().filter(|i| i.is_unarmed()).cloned().collect();
        unarmed.sort_by_key(|i| i.created_at);
        unarmed.truncate(limit);
        Ok(unarmed)
    }

    async fn arm(
        &self,
        id: WorkItemId,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_item(id, |item| Ok(item.arm(at, now)))
    }

    async fn fail_unarmed(
        &self,
        id: WorkItemId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.with_item(id, |item| Ok(item.fail_unarmed(reason, now)))
    }

    async fn reset_stale_locks(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut items = self.write()?;
        let mut reset = 0;
        for item in items.values_mut() {
            let stale = item.lock_owner.is_some()
                && item.lock_acquired_at.is_none_or(|at| at < stale_before);
            if stale {
                item.reset_lock(now);
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn list(&self, filter: &WorkItemFilter) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.read()?;
        let mut result: Vec<_> = items.values().filter(|i| filter.matches(i)).cloned().collect();
        result.sort_by_key(|i| (i.created_at, i.id));
        result.truncate(filter.limit);
        Ok(result)
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkItem>, StoreError> {
        let items = self.read()?;
        let mut due: Vec<_> = items
            .values()
            .filter(|i| {
                i.enabled && i.lock_owner.is_none() && i.status.is_waiting() && i.is_due(now)
            })
            .cloned()
            .collect();
        due.sort_by(candidate_order);
        due.truncate(limit);
        Ok(due)
    }

    async fn stats(&self) -> Result<WorkItemStats, StoreError> {
        let items = self.read()?;
        let mut stats = WorkItemStats::default();
        for item in items.values() {
            stats.record(item.status, 1);
        }
        Ok(stats)
    }
}
