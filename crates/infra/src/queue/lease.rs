//! Lease manager: claim, renew and release on top of the store's
//! conditional updates.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use workforge_core::{Transition, WorkItem, WorkItemId, WorkerId};

use super::store::{StoreError, WorkItemStore};

/// A lease on one work item, bound to a single execution attempt.
#[derive(Debug, Clone)]
pub struct Claim {
    /// Row state right after the claim.
    pub item: WorkItem,
    pub worker_id: WorkerId,
    pub acquired_at: DateTime<Utc>,
    /// Worker whose expired lease was taken over, if any.
    pub reclaimed_from: Option<WorkerId>,
}

impl Claim {
    pub fn id(&self) -> WorkItemId {
        self.item.id
    }

    pub fn is_reclaim(&self) -> bool {
        self.reclaimed_from.is_some()
    }
}

#[derive(Debug, Clone)]
pub enum ClaimResult {
    Claimed(Claim),
    /// Held by someone else, not due, disabled or terminal.
    NotAvailable,
}

impl ClaimResult {
    pub fn into_claim(self) -> Option<Claim> {
        match self {
            ClaimResult::Claimed(claim) => Some(claim),
            ClaimResult::NotAvailable => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The lease expired and was taken over; the outcome was discarded.
    LeaseLost,
}

/// Claims leases on behalf of one worker.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn WorkItemStore>,
    worker_id: WorkerId,
    lease_duration: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn WorkItemStore>, worker_id: WorkerId, lease_duration: Duration) -> Self {
        Self {
            store,
            worker_id,
            lease_duration,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn store(&self) -> &Arc<dyn WorkItemStore> {
        &self.store
    }

    pub async fn try_claim(
        &self,
        id: WorkItemId,
        now: DateTime<Utc>,
    ) -> Result<ClaimResult, StoreError> {
        let claimed = self
            .store
            .try_claim(id, &self.worker_id, self.lease_duration, now)
            .await?;

        let Some(row) = claimed else {
            debug!(work_item_id = %id, worker_id = %self.worker_id, "work item not available");
            return Ok(ClaimResult::NotAvailable);
        };

        if let Some(previous) = &row.reclaimed_from {
            warn!(
                work_item_id = %id,
                worker_id = %self.worker_id,
                previous_owner = %previous,
                attempts = row.item.attempts,
                "reclaimed expired lease"
            );
        } else {
            debug!(work_item_id = %id, worker_id = %self.worker_id, "lease acquired");
        }

        Ok(ClaimResult::Claimed(Claim {
            item: row.item,
            worker_id: self.worker_id.clone(),
            acquired_at: now,
            reclaimed_from: row.reclaimed_from,
        }))
    }

    /// `Leased -> Running`. `false` means the lease is gone.
    pub async fn mark_running(&self, claim: &Claim, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.store.mark_running(claim.id(), &claim.worker_id, now).await
    }

    /// Extend the lease. `false` means it was lost to another worker.
    pub async fn renew(&self, claim: &Claim, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let renewed = self.store.renew(claim.id(), &claim.worker_id, now).await?;
        if !renewed {
            warn!(work_item_id = %claim.id(), worker_id = %claim.worker_id, "lease renewal rejected");
        }
        Ok(renewed)
    }

    /// Apply `transition` and drop the lease.
    pub async fn release(
        &self,
        claim: Claim,
        transition: &Transition,
    ) -> Result<ReleaseOutcome, StoreError> {
        let released = self
            .store
            .release(claim.id(), &claim.worker_id, transition)
            .await?;

        if released {
            debug!(
                work_item_id = %claim.id(),
                worker_id = %claim.worker_id,
                status = %transition.status,
                "lease released"
            );
            Ok(ReleaseOutcome::Released)
        } else {
            warn!(
                work_item_id = %claim.id(),
                worker_id = %claim.worker_id,
                "lease lost before release; outcome discarded"
            );
            Ok(ReleaseOutcome::LeaseLost)
        }
    }
}
