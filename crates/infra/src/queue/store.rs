//! Work-item store abstraction.
//!
//! The store is the only component that talks to the shared database. Every
//! state change that matters for mutual exclusion (`try_claim`, `release`,
//! `renew`, `arm`) is a single conditional update executed in its own short
//! unit of work, independent of any transaction held by the caller.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use workforge_core::{
    DomainError, Transition, WorkItem, WorkItemId, WorkItemStatus, WorkItemUpdate, WorkerId,
};

/// Work-item store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("work item not found: {0}")]
    NotFound(WorkItemId),
    #[error("work item already exists: {0}")]
    AlreadyExists(WorkItemId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// A successful claim as returned by the store.
#[derive(Debug, Clone)]
pub struct ClaimedRow {
    /// Row state after the claim (status `Leased`, lock set).
    pub item: WorkItem,
    /// Holder of the expired lease that was taken over, if any.
    pub reclaimed_from: Option<WorkerId>,
}

/// Filter for listing work items.
#[derive(Debug, Clone)]
pub struct WorkItemFilter {
    pub status: Option<WorkItemStatus>,
    pub work_type: Option<String>,
    pub limit: usize,
}

impl Default for WorkItemFilter {
    fn default() -> Self {
        Self {
            status: None,
            work_type: None,
            limit: 100,
        }
    }
}

impl WorkItemFilter {
    pub fn with_status(mut self, status: WorkItemStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_work_type(mut self, work_type: impl Into<String>) -> Self {
        self.work_type = Some(work_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, item: &WorkItem) -> bool {
        self.status.is_none_or(|s| item.status == s)
            && self
                .work_type
                .as_deref()
                .is_none_or(|t| item.work_type == t)
    }
}

/// Count of work items per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkItemStats {
    pub pending: usize,
    pub leased: usize,
    pub running: usize,
    pub retry_wait: usize,
    pub completed: usize,
    pub failed: usize,
    pub disabled: usize,
}

impl WorkItemStats {
    pub fn record(&mut self, status: WorkItemStatus, count: usize) {
        let slot = match status {
            WorkItemStatus::Pending => &mut self.pending,
            WorkItemStatus::Leased => &mut self.leased,
            WorkItemStatus::Running => &mut self.running,
            WorkItemStatus::RetryWait => &mut self.retry_wait,
            WorkItemStatus::Completed => &mut self.completed,
            WorkItemStatus::Failed => &mut self.failed,
            WorkItemStatus::Disabled => &mut self.disabled,
        };
        *slot += count;
    }

    pub fn total(&self) -> usize {
        self.pending
            + self.leased
            + self.running
            + self.retry_wait
            + self.completed
            + self.failed
            + self.disabled
    }
}

/// Candidate ordering used by every store: type priority (higher first), then
/// earliest due time.
pub fn candidate_order(a: &WorkItem, b: &WorkItem) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| match (a.next_execution_at, b.next_execution_at) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Durable work-item storage.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Persist a new item.
    async fn insert(&self, item: WorkItem) -> Result<WorkItemId, StoreError>;

    /// Get an item by ID.
    async fn get(&self, id: WorkItemId) -> Result<Option<WorkItem>, StoreError>;

    /// Edit definition fields (budget, priority, schedule, due time).
    async fn update_definition(
        &self,
        id: WorkItemId,
        update: &WorkItemUpdate,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, StoreError>;

    /// Remove an item. Refused while it is leased.
    async fn delete(&self, id: WorkItemId) -> Result<(), StoreError>;

    async fn set_enabled(
        &self,
        id: WorkItemId,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, StoreError>;

    /// Make a waiting item due now.
    async fn force_run(&self, id: WorkItemId, now: DateTime<Utc>) -> Result<WorkItem, StoreError>;

    /// Due unlocked items plus items whose lease has expired, in candidate order.
    async fn find_candidates(
        &self,
        now: DateTime<Utc>,
        lease_duration: Duration,
        limit: usize,
    ) -> Result<Vec<WorkItem>, StoreError>;

    /// Atomically claim `id` for `worker`. `None` means someone else holds it
    /// or it is no longer claimable.
    async fn try_claim(
        &self,
        id: WorkItemId,
        worker: &WorkerId,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedRow>, StoreError>;

    /// `Leased -> Running`, only for the lease holder.
    async fn mark_running(
        &self,
        id: WorkItemId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Extend the lease, only for the lease holder.
    async fn renew(
        &self,
        id: WorkItemId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Write the transition and clear the lock, only for the lease holder.
    /// `false` means the lease was lost and nothing was written.
    async fn release(
        &self,
        id: WorkItemId,
        worker: &WorkerId,
        transition: &Transition,
    ) -> Result<bool, StoreError>;

    /// Recurring items waiting for a due time.
    async fn find_unarmed(&self, limit: usize) -> Result<Vec<WorkItem>, StoreError>;

    /// Set the due time of an unarmed recurring item. `false` if already armed.
    async fn arm(
        &self,
        id: WorkItemId,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Fail an unarmed recurring item whose schedule yields no fire time.
    /// `false` if it is no longer unarmed.
    async fn fail_unarmed(
        &self,
        id: WorkItemId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Clear locks acquired before `stale_before`; returns how many were reset.
    async fn reset_stale_locks(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// List items matching `filter`, oldest first.
    async fn list(&self, filter: &WorkItemFilter) -> Result<Vec<WorkItem>, StoreError>;

    /// Due, enabled, unlocked items in candidate order.
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkItem>, StoreError>;

    async fn stats(&self) -> Result<WorkItemStats, StoreError>;
}
