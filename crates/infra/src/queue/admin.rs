//! Admin operations exposed to the surrounding application.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use workforge_core::{
    DomainError, Parameter, Schedule, WorkItem, WorkItemId, WorkItemStatus, WorkItemUpdate,
};

use super::registry::{HandlerRegistry, RegistryError};
use super::store::{StoreError, WorkItemFilter, WorkItemStats, WorkItemStore};

#[derive(Debug, Clone, Error)]
pub enum AdminError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Request to create a work item.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub work_type: String,
    pub payload: serde_json::Value,
    pub parameters: Vec<Parameter>,
    /// Makes the item recurring.
    pub schedule: Option<Schedule>,
    /// First due time for one-off items; defaults to now.
    pub run_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

impl NewWorkItem {
    pub fn new(work_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            work_type: work_type.into(),
            payload,
            parameters: Vec::new(),
            schedule: None,
            run_at: None,
            enabled: true,
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::new(name, value));
        self
    }

    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Create/update/delete, enable/disable, force-run, listing and the stale
/// lock reset, on top of a store and the process's handler registry.
#[derive(Clone)]
pub struct WorkItemAdmin {
    store: Arc<dyn WorkItemStore>,
    registry: Arc<HandlerRegistry>,
}

impl WorkItemAdmin {
    pub fn new(store: Arc<dyn WorkItemStore>, registry: Arc<HandlerRegistry>) -> Self {
        Self { store, registry }
    }

    /// Create an item. Its type must resolve in the registry; budget and
    /// priority are copied from the resolved task type.
    pub async fn create(&self, request: NewWorkItem) -> Result<WorkItem, AdminError> {
        let registration = self.registry.resolve(&request.work_type)?;

        let mut item = WorkItem::new(&registration.task_type, request.payload)
            .with_parameters(request.parameters);
        item.work_type = request.work_type;
        if let Some(at) = request.run_at {
            item = item.scheduled_at(at);
        }
        if let Some(schedule) = request.schedule {
            schedule.validate()?;
            item = item.with_schedule(schedule);
        }
        if !request.enabled {
            item = item.disabled();
        }
        item.validate()?;

        self.store.insert(item.clone()).await?;
        info!(
            work_item_id = %item.id,
            work_type = %item.work_type,
            recurring = item.is_recurring(),
            "work item created"
        );
        Ok(item)
    }

    pub async fn update(&self, id: WorkItemId, update: WorkItemUpdate) -> Result<WorkItem, AdminError> {
        let item = self.store.update_definition(id, &update, Utc::now()).await?;
        info!(work_item_id = %id, "work item updated");
        Ok(item)
    }

    pub async fn delete(&self, id: WorkItemId) -> Result<(), AdminError> {
        self.store.delete(id).await?;
        info!(work_item_id = %id, "work item deleted");
        Ok(())
    }

    /// Re-enable. Recurring items are re-armed from the current time.
    pub async fn enable(&self, id: WorkItemId) -> Result<WorkItem, AdminError> {
        let item = self.store.set_enabled(id, true, Utc::now()).await?;
        info!(work_item_id = %id, status = %item.status, "work item enabled");
        Ok(item)
    }

    /// Disable. An in-flight execution finishes and lands in `Disabled`.
    pub async fn disable(&self, id: WorkItemId) -> Result<WorkItem, AdminError> {
        let item = self.store.set_enabled(id, false, Utc::now()).await?;
        info!(work_item_id = %id, status = %item.status, "work item disabled");
        Ok(item)
    }

    pub async fn force_run(&self, id: WorkItemId) -> Result<WorkItem, AdminError> {
        let item = self.store.force_run(id, Utc::now()).await?;
        info!(work_item_id = %id, "work item forced to run now");
        Ok(item)
    }

    /// Current state of an item, including `last_error` and `failure_class`.
    pub async fn status(&self, id: WorkItemId) -> Result<WorkItem, AdminError> {
        Ok(self
            .store
            .get(id)
            .await?
            .ok_or(StoreError::NotFound(id))?)
    }

    pub async fn list(&self, filter: &WorkItemFilter) -> Result<Vec<WorkItem>, AdminError> {
        Ok(self.store.list(filter).await?)
    }

    pub async fn list_pending(&self, limit: usize) -> Result<Vec<WorkItem>, AdminError> {
        let filter = WorkItemFilter::default()
            .with_status(WorkItemStatus::Pending)
            .with_limit(limit);
        Ok(self.store.list(&filter).await?)
    }

    pub async fn list_due(&self, limit: usize) -> Result<Vec<WorkItem>, AdminError> {
        Ok(self.store.list_due(Utc::now(), limit).await?)
    }

    pub async fn stats(&self) -> Result<WorkItemStats, AdminError> {
        Ok(self.store.stats().await?)
    }

    /// Unstick items whose lock is older than `lease_duration`, without
    /// charging an attempt. For use after abnormal worker termination.
    pub async fn reset_stale_locks(&self, lease_duration: Duration) -> Result<u64, AdminError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease_duration)
            .map_err(|_| DomainError::validation("lease duration out of range"))?;
        let reset = self.store.reset_stale_locks(now - lease, now).await?;
        if reset > 0 {
            warn!(reset, "reset stale work item locks");
        }
        Ok(reset)
    }
}
