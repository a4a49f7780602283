//! Handlers every worker process registers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use workforge_core::{HandlerError, TaskType, WorkItem};
use workforge_infra::queue::{HandlerRegistry, RegistryError, WorkHandler, WorkItemStore};

/// Logs the payload and succeeds. Useful for smoke-testing a deployment.
struct EchoHandler;

#[async_trait]
impl WorkHandler for EchoHandler {
    async fn execute(&self, item: &WorkItem) -> Result<(), HandlerError> {
        info!(work_item_id = %item.id, payload = %item.payload, "echo");
        Ok(())
    }
}

/// Unsticks locks left behind by crashed workers, without charging attempts.
/// Meant to be created as a recurring item.
struct ResetStaleLocksHandler {
    store: Arc<dyn WorkItemStore>,
    lease_duration: Duration,
}

#[async_trait]
impl WorkHandler for ResetStaleLocksHandler {
    async fn execute(&self, item: &WorkItem) -> Result<(), HandlerError> {
        // Only touch locks well past expiry; live leases renew every third of this.
        let grace = chrono::Duration::from_std(self.lease_duration * 2)
            .map_err(|e| HandlerError::fatal(e.to_string()))?;
        let now = Utc::now();

        let reset = self
            .store
            .reset_stale_locks(now - grace, now)
            .await
            .map_err(|e| HandlerError::retryable(e.to_string()))?;
        if reset > 0 {
            warn!(work_item_id = %item.id, reset, "reset stale work item locks");
        }
        Ok(())
    }
}

pub fn register_builtin(
    registry: &mut HandlerRegistry,
    store: Arc<dyn WorkItemStore>,
    lease_duration: Duration,
) -> Result<(), RegistryError> {
    registry.register(TaskType::new("system.echo"), Arc::new(EchoHandler))?;
    registry.register(
        TaskType::new("system.reset_stale_locks").with_max_attempts(1),
        Arc::new(ResetStaleLocksHandler {
            store,
            lease_duration,
        }),
    )?;
    Ok(())
}
