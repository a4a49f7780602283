//! Retry & failure policy: from an execution result to the item's next state.
//!
//! Failure classification and step progress are kept apart. Classified
//! failures spend the attempt budget; a step that is merely not ready yet
//! does not.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::failure::FailureClass;
use crate::retry::RetryPolicy;
use crate::task_type::TaskType;
use crate::work_item::{WorkItem, WorkItemStatus};

/// Result of one leased execution, as seen by the policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionResult {
    /// The current step finished; `next_step` runs next.
    StepComplete { next_step: String },
    /// The current step is not ready; run it again later.
    StepPending,
    /// The whole item is done.
    Completed,
    RetryableFailure { reason: String },
    FatalFailure { reason: String },
}

impl ExecutionResult {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::RetryableFailure {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::FatalFailure {
            reason: reason.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ExecutionResult::RetryableFailure { .. } | ExecutionResult::FatalFailure { .. }
        )
    }
}

/// Type-level knobs the policy needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPolicy {
    pub retry: RetryPolicy,
    pub step_poll_interval: Duration,
}

impl TransitionPolicy {
    pub fn for_type(task_type: &TaskType) -> Self {
        Self {
            retry: task_type.retry_policy.clone(),
            step_poll_interval: task_type.step_poll_interval,
        }
    }
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            step_poll_interval: Duration::from_secs(5),
        }
    }
}

/// The mutable fields written back when a lease is released.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub status: WorkItemStatus,
    pub step: Option<String>,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub next_execution_at: Option<DateTime<Utc>>,
    pub last_executed_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub failure_class: Option<FailureClass>,
}

impl Transition {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Terminal failure for an item whose attempt budget is already spent
    /// (e.g. reclaimed from crashed workers too many times).
    pub fn exhausted(item: &WorkItem, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            status: WorkItemStatus::Failed,
            step: item.step.clone(),
            payload: item.payload.clone(),
            attempts: item.attempts,
            next_execution_at: None,
            last_executed_at: now,
            last_error: Some(reason.into()),
            failure_class: Some(FailureClass::Poison),
        }
    }

    /// Apply onto a row (used by in-process stores and tests).
    pub fn apply_to(&self, item: &mut WorkItem) {
        item.status = self.status;
        item.step = self.step.clone();
        item.payload = self.payload.clone();
        item.attempts = self.attempts;
        item.next_execution_at = self.next_execution_at;
        item.last_executed_at = Some(self.last_executed_at);
        item.last_error = self.last_error.clone();
        item.failure_class = self.failure_class;
        item.updated_at = self.last_executed_at;
    }
}

/// Decide the next state of `item` after an execution.
///
/// `payload` is what gets persisted: the handler's mutated payload on success
/// paths, the unchanged one after a failure.
pub fn decide(
    item: &WorkItem,
    policy: &TransitionPolicy,
    result: ExecutionResult,
    payload: serde_json::Value,
    now: DateTime<Utc>,
) -> Transition {
    let mut next = Transition {
        status: WorkItemStatus::Pending,
        step: item.step.clone(),
        payload,
        attempts: item.attempts,
        next_execution_at: None,
        last_executed_at: now,
        last_error: item.last_error.clone(),
        failure_class: item.failure_class,
    };

    match result {
        ExecutionResult::Completed => match &item.schedule {
            None => {
                next.status = WorkItemStatus::Completed;
                next.last_error = None;
                next.failure_class = None;
            }
            Some(schedule) => match schedule.next_after(Some(now), now) {
                Ok(at) => {
                    // Re-arm for the next occurrence with a fresh budget.
                    next.step = None;
                    next.attempts = 0;
                    next.next_execution_at = Some(at);
                    next.last_error = None;
                    next.failure_class = None;
                }
                Err(e) => {
                    next.status = WorkItemStatus::Failed;
                    next.last_error = Some(e.to_string());
                    next.failure_class = Some(FailureClass::Fatal);
                }
            },
        },
        ExecutionResult::StepComplete { next_step } => {
            next.step = Some(next_step);
            next.next_execution_at = Some(now);
        }
        ExecutionResult::StepPending => {
            next.next_execution_at = Some(now + to_chrono(policy.step_poll_interval));
        }
        ExecutionResult::RetryableFailure { reason } => {
            next.attempts = item.attempts.saturating_add(1);
            next.last_error = Some(reason);
            if next.attempts >= item.max_attempts {
                next.status = WorkItemStatus::Failed;
                next.failure_class = Some(FailureClass::Poison);
            } else {
                next.status = WorkItemStatus::RetryWait;
                next.next_execution_at =
                    Some(now + to_chrono(policy.retry.delay_for_attempt(next.attempts)));
                next.failure_class = Some(FailureClass::Retryable);
            }
        }
        ExecutionResult::FatalFailure { reason } => {
            next.attempts = item.attempts.saturating_add(1).min(item.max_attempts);
            next.status = WorkItemStatus::Failed;
            next.last_error = Some(reason);
            next.failure_class = Some(FailureClass::Fatal);
        }
    }

    next
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_default()
}
