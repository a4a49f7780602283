//! Scheduling trigger for recurring work items.
//!
//! Computing the next fire time is pure and lock-free. Only arming (setting
//! `next_execution_at` on an unarmed item) is a conditional update, so two
//! workers evaluating the same item arm it once.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use super::store::{StoreError, WorkItemStore};

#[derive(Clone)]
pub struct SchedulingTrigger {
    store: Arc<dyn WorkItemStore>,
}

impl SchedulingTrigger {
    pub fn new(store: Arc<dyn WorkItemStore>) -> Self {
        Self { store }
    }

    /// Arm up to `limit` unarmed recurring items. Returns how many this call
    /// armed; items armed concurrently by another worker are not counted.
    pub async fn arm_due(&self, now: DateTime<Utc>, limit: usize) -> Result<usize, StoreError> {
        let unarmed = self.store.find_unarmed(limit).await?;
        let mut armed = 0;

        for item in unarmed {
            let Some(schedule) = &item.schedule else {
                continue;
            };
            let next = match schedule.next_after(item.last_executed_at, now) {
                Ok(next) => next,
                Err(e) => {
                    // Terminal: left unarmed it would be re-evaluated forever.
                    let reason = e.to_string();
                    if self.store.fail_unarmed(item.id, &reason, now).await? {
                        error!(
                            work_item_id = %item.id,
                            work_type = %item.work_type,
                            error = %reason,
                            "recurring work item failed: no next fire time"
                        );
                    } else {
                        warn!(work_item_id = %item.id, "unschedulable work item changed concurrently");
                    }
                    continue;
                }
            };

            if self.store.arm(item.id, next, now).await? {
                debug!(work_item_id = %item.id, next_execution_at = %next, "armed recurring work item");
                armed += 1;
            }
        }

        Ok(armed)
    }
}
