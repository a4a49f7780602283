//! The persisted unit of work (job, task, or queued message).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::failure::FailureClass;
use crate::id::{WorkItemId, WorkerId};
use crate::retry::MAX_ATTEMPTS_LIMIT;
use crate::schedule::Schedule;
use crate::task_type::TaskType;
use crate::transition::Transition;

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    /// Waiting for `next_execution_at` (or for arming, when that is null).
    Pending,
    /// Claimed by a worker, handler not started yet.
    Leased,
    /// Handler executing under a lease.
    Running,
    /// Failed transiently; due again at `next_execution_at`.
    RetryWait,
    /// Finished successfully (terminal).
    Completed,
    /// Fatal or poison failure (terminal).
    Failed,
    /// Switched off by an operator; invisible to dispatchers.
    Disabled,
}

impl WorkItemStatus {
    pub const ALL: [WorkItemStatus; 7] = [
        WorkItemStatus::Pending,
        WorkItemStatus::Leased,
        WorkItemStatus::Running,
        WorkItemStatus::RetryWait,
        WorkItemStatus::Completed,
        WorkItemStatus::Failed,
        WorkItemStatus::Disabled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Leased => "leased",
            WorkItemStatus::Running => "running",
            WorkItemStatus::RetryWait => "retry_wait",
            WorkItemStatus::Completed => "completed",
            WorkItemStatus::Failed => "failed",
            WorkItemStatus::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> DomainResult<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str() == value)
            .ok_or_else(|| DomainError::validation(format!("unknown work item status '{value}'")))
    }

    /// No further lease may ever be granted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkItemStatus::Completed | WorkItemStatus::Failed)
    }

    /// Waiting to be claimed once due.
    pub fn is_waiting(&self) -> bool {
        matches!(self, WorkItemStatus::Pending | WorkItemStatus::RetryWait)
    }

    /// Held under a lease.
    pub fn is_leased(&self) -> bool {
        matches!(self, WorkItemStatus::Leased | WorkItemStatus::Running)
    }
}

impl core::fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name/value input supplied at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub value: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Whether (and how) an item can be claimed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claimability {
    /// Due and unlocked.
    Fresh,
    /// Locked, but the holder's lease has expired.
    Stale,
    NotClaimable,
}

/// Operator edit of a work item definition. `None` leaves a field as is;
/// `schedule: Some(None)` turns a recurring item into a one-off.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkItemUpdate {
    pub max_attempts: Option<u32>,
    pub priority: Option<i32>,
    pub schedule: Option<Option<Schedule>>,
    pub next_execution_at: Option<DateTime<Utc>>,
}

/// A work item row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    /// Registry key of the handler.
    pub work_type: String,
    pub status: WorkItemStatus,
    /// Handler input/state; written only under a lease.
    pub payload: serde_json::Value,
    /// Next step to run for multistep items; null means the first step.
    pub step: Option<String>,
    /// Failed executions so far.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Copied from the task type at creation.
    pub priority: i32,
    pub lock_owner: Option<WorkerId>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
    /// Due time. Null while a recurring item waits to be armed.
    pub next_execution_at: Option<DateTime<Utc>>,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub parameters: Vec<Parameter>,
    /// Present for recurring (cron-style) items.
    pub schedule: Option<Schedule>,
    pub last_error: Option<String>,
    pub failure_class: Option<FailureClass>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// A new single-run item of `task_type`, due immediately.
    pub fn new(task_type: &TaskType, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: WorkItemId::new(),
            work_type: task_type.code.clone(),
            status: WorkItemStatus::Pending,
            payload,
            step: None,
            attempts: 0,
            max_attempts: task_type.max_attempts(),
            priority: task_type.priority,
            lock_owner: None,
            lock_acquired_at: None,
            next_execution_at: Some(now),
            last_executed_at: None,
            enabled: true,
            parameters: Vec::new(),
            schedule: None,
            last_error: None,
            failure_class: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.push(Parameter::new(name, value));
        self
    }

    /// Make the item recurring. It stays unarmed until the trigger computes a due time.
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self.next_execution_at = None;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_execution_at = Some(at);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        let base = self.next_execution_at.unwrap_or(self.created_at);
        self.next_execution_at =
            Some(base + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self.status = WorkItemStatus::Disabled;
        self
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    pub fn is_recurring(&self) -> bool {
        self.schedule.is_some()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_execution_at.is_some_and(|at| at <= now)
    }

    /// The lease holder has not been heard from for longer than `lease_duration`.
    pub fn lease_expired(&self, now: DateTime<Utc>, lease_duration: Duration) -> bool {
        match (&self.lock_owner, self.lock_acquired_at) {
            (Some(_), Some(acquired)) => {
                let lease = chrono::Duration::from_std(lease_duration)
                    .unwrap_or_else(|_| chrono::Duration::days(36_500));
                now.signed_duration_since(acquired) > lease
            }
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Claim predicate shared by every store implementation.
    pub fn claimability(&self, now: DateTime<Utc>, lease_duration: Duration) -> Claimability {
        if !self.enabled || self.status.is_terminal() {
            return Claimability::NotClaimable;
        }
        if self.lock_owner.is_none() {
            if self.status.is_waiting() && self.is_due(now) {
                return Claimability::Fresh;
            }
            return Claimability::NotClaimable;
        }
        if self.status.is_leased() && self.lease_expired(now, lease_duration) {
            return Claimability::Stale;
        }
        Claimability::NotClaimable
    }

    /// Whether `worker` currently holds the lock.
    pub fn is_locked_by(&self, worker: &WorkerId) -> bool {
        self.lock_owner.as_ref() == Some(worker)
    }

    /// Take the lease. Reclaiming a stale lease charges the crashed execution
    /// as one failed attempt; returns the previous holder in that case.
    pub fn lease_to(
        &mut self,
        worker: &WorkerId,
        now: DateTime<Utc>,
        claimability: Claimability,
    ) -> DomainResult<Option<WorkerId>> {
        let previous = match claimability {
            Claimability::Fresh => None,
            Claimability::Stale => {
                self.attempts = self.attempts.saturating_add(1).min(self.max_attempts);
                self.lock_owner.take()
            }
            Claimability::NotClaimable => {
                return Err(DomainError::invalid_transition(format!(
                    "work item {} is not claimable",
                    self.id
                )));
            }
        };
        self.status = WorkItemStatus::Leased;
        self.lock_owner = Some(worker.clone());
        self.lock_acquired_at = Some(now);
        self.updated_at = now;
        Ok(previous)
    }

    /// Write a transition back and drop the lease.
    ///
    /// An item disabled while in flight lands in `Disabled` unless the
    /// transition is terminal.
    pub fn release(&mut self, transition: &Transition) {
        transition.apply_to(self);
        if !self.enabled && !self.status.is_terminal() {
            self.status = WorkItemStatus::Disabled;
        }
        self.lock_owner = None;
        self.lock_acquired_at = None;
    }

    /// Operator unstick: drop a lock without charging an attempt.
    pub fn reset_lock(&mut self, now: DateTime<Utc>) {
        self.lock_owner = None;
        self.lock_acquired_at = None;
        if self.status.is_leased() {
            self.status = if self.enabled {
                WorkItemStatus::Pending
            } else {
                WorkItemStatus::Disabled
            };
            if self.next_execution_at.is_none() && !self.is_recurring() {
                self.next_execution_at = Some(now);
            }
        }
        self.updated_at = now;
    }

    /// A recurring item waiting for its first (or re-enabled) due time.
    pub fn is_unarmed(&self) -> bool {
        self.is_recurring()
            && self.enabled
            && self.status == WorkItemStatus::Pending
            && self.lock_owner.is_none()
            && self.next_execution_at.is_none()
    }

    /// Arm an unarmed recurring item. Returns false if someone else already did.
    pub fn arm(&mut self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        if !self.is_unarmed() {
            return false;
        }
        self.next_execution_at = Some(at);
        self.updated_at = now;
        true
    }

    /// Fail an unarmed recurring item whose schedule can never fire.
    /// Returns false if it was armed, leased or changed in the meantime.
    pub fn fail_unarmed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        if !self.is_unarmed() {
            return false;
        }
        self.status = WorkItemStatus::Failed;
        self.failure_class = Some(FailureClass::Fatal);
        self.last_error = Some(reason.into());
        self.updated_at = now;
        true
    }

    /// Enable or disable. An in-flight execution is not interrupted; it lands
    /// in `Disabled` when released.
    pub fn set_enabled(&mut self, enabled: bool, now: DateTime<Utc>) {
        let was_enabled = self.enabled;
        self.enabled = enabled;
        self.updated_at = now;

        if self.status.is_terminal() || self.status.is_leased() {
            return;
        }
        if !enabled {
            self.status = WorkItemStatus::Disabled;
            return;
        }
        if self.status == WorkItemStatus::Disabled {
            self.status = WorkItemStatus::Pending;
        }
        if !was_enabled && self.is_recurring() {
            // Re-arm from now rather than replaying missed fires.
            self.next_execution_at = None;
        } else if self.next_execution_at.is_none() && !self.is_recurring() {
            self.next_execution_at = Some(now);
        }
    }

    /// Make a waiting item due immediately.
    pub fn force_run(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(format!(
                "work item {} is {} and cannot run again",
                self.id, self.status
            )));
        }
        if self.status.is_leased() {
            return Err(DomainError::invalid_transition(format!(
                "work item {} is already {}",
                self.id, self.status
            )));
        }
        if !self.enabled {
            return Err(DomainError::invalid_transition(format!(
                "work item {} is disabled",
                self.id
            )));
        }
        self.status = WorkItemStatus::Pending;
        self.next_execution_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Apply an operator edit of the definition fields.
    pub fn apply_update(&mut self, update: &WorkItemUpdate, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() || self.status.is_leased() {
            return Err(DomainError::invalid_transition(format!(
                "work item {} is {} and cannot be edited",
                self.id, self.status
            )));
        }
        if let Some(max_attempts) = update.max_attempts {
            if max_attempts > MAX_ATTEMPTS_LIMIT {
                return Err(DomainError::validation(format!(
                    "max_attempts must not exceed {MAX_ATTEMPTS_LIMIT}"
                )));
            }
            if max_attempts <= self.attempts {
                return Err(DomainError::validation(format!(
                    "max_attempts {max_attempts} must exceed the {} attempts already spent",
                    self.attempts
                )));
            }
            self.max_attempts = max_attempts;
        }
        if let Some(priority) = update.priority {
            self.priority = priority;
        }
        if let Some(schedule) = &update.schedule {
            if let Some(schedule) = schedule {
                schedule.validate()?;
            }
            self.schedule = schedule.clone();
            if self.schedule.is_some() {
                self.next_execution_at = None;
            }
        }
        if let Some(at) = update.next_execution_at {
            self.next_execution_at = Some(at);
        }
        if self.schedule.is_none() && self.next_execution_at.is_none() {
            self.next_execution_at = Some(now);
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.work_type.trim().is_empty() {
            return Err(DomainError::validation("work_type must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be at least 1"));
        }
        if self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(DomainError::validation(format!(
                "max_attempts must not exceed {MAX_ATTEMPTS_LIMIT}"
            )));
        }
        if self.attempts > self.max_attempts {
            return Err(DomainError::invariant(format!(
                "attempts {} exceeds max_attempts {}",
                self.attempts, self.max_attempts
            )));
        }
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        Ok(())
    }
}
