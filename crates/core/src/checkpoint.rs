//! Step checkpoint model for multistep work items.
//!
//! The persisted `step` names the phase to run next. A handler only sees the
//! current step and the payload; advancing, holding, or finishing is decided
//! here from its `StepResult`.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::task_type::TaskType;
use crate::transition::ExecutionResult;

/// What a step handler reports on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepResult {
    /// The step is done; move on.
    Complete,
    /// The step's dependency is not ready; run the same step again later.
    Incomplete,
}

impl StepResult {
    /// Map a legacy boolean step result through the type's polarity.
    pub fn from_flag(flag: bool, polarity: StepFlagPolarity) -> Self {
        let complete = match polarity {
            StepFlagPolarity::TrueMeansComplete => flag,
            StepFlagPolarity::TrueMeansIncomplete => !flag,
        };
        if complete {
            StepResult::Complete
        } else {
            StepResult::Incomplete
        }
    }
}

/// Meaning of `true` for handlers that report step results as a boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFlagPolarity {
    #[default]
    TrueMeansComplete,
    TrueMeansIncomplete,
}

/// The step being executed, as handed to a step handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepDescriptor {
    pub name: String,
    /// Zero-based position in the sequence.
    pub index: usize,
    pub total: usize,
}

impl StepDescriptor {
    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.total
    }
}

/// Resolve the persisted step (null means the first step).
pub fn resolve_step(task_type: &TaskType, step: Option<&str>) -> DomainResult<StepDescriptor> {
    let total = task_type.step_sequence.len();
    if total == 0 {
        return Err(DomainError::invariant(format!(
            "task type '{}' has no steps",
            task_type.code
        )));
    }

    let index = match step {
        None => 0,
        Some(name) => task_type
            .step_sequence
            .iter()
            .position(|s| s == name)
            .ok_or_else(|| DomainError::unknown_step(&task_type.code, name))?,
    };

    Ok(StepDescriptor {
        name: task_type.step_sequence[index].clone(),
        index,
        total,
    })
}

/// Turn a step handler's result into an execution result for the retry policy.
pub fn advance(task_type: &TaskType, current: &StepDescriptor, result: StepResult) -> ExecutionResult {
    match result {
        StepResult::Incomplete => ExecutionResult::StepPending,
        StepResult::Complete => match task_type.step_sequence.get(current.index + 1) {
            Some(next) => ExecutionResult::StepComplete {
                next_step: next.clone(),
            },
            None => ExecutionResult::Completed,
        },
    }
}
