//! `workforge-core`: work-queue domain building blocks.
//!
//! This crate contains the **pure** model of the lease-scheduling core (no I/O):
//! work items and their status machine, task type configuration, the retry &
//! failure policy, the step checkpoint model and recurrence schedules.

pub mod checkpoint;
pub mod error;
pub mod failure;
pub mod id;
pub mod retry;
pub mod schedule;
pub mod task_type;
pub mod transition;
pub mod work_item;

pub use checkpoint::{StepDescriptor, StepFlagPolarity, StepResult};
pub use error::{DomainError, DomainResult};
pub use failure::{FailureClass, FailureClassification, FailureKind, HandlerError};
pub use id::{WorkItemId, WorkerId};
pub use retry::{BackoffStrategy, RetryPolicy, MAX_ATTEMPTS_LIMIT};
pub use schedule::Schedule;
pub use task_type::TaskType;
pub use transition::{decide, ExecutionResult, Transition, TransitionPolicy};
pub use work_item::{Claimability, Parameter, WorkItem, WorkItemStatus, WorkItemUpdate};
