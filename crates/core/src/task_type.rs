//! Task type definitions (configuration, not runtime state).

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checkpoint::StepFlagPolarity;
use crate::error::{DomainError, DomainResult};
use crate::failure::FailureClassification;
use crate::retry::RetryPolicy;

/// Static configuration shared by every work item of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskType {
    /// Registry key; matches `WorkItem::work_type`.
    pub code: String,
    pub display_name: String,
    /// Higher runs first. Type-level, copied onto items at creation.
    pub priority: i32,
    pub retry_policy: RetryPolicy,
    /// Ordered step names; empty for single-shot types.
    pub step_sequence: Vec<String>,
    pub failure_classification: FailureClassification,
    /// Delay before a step that reported "not ready" is offered again.
    pub step_poll_interval: Duration,
    pub step_flag_polarity: StepFlagPolarity,
}

impl TaskType {
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            display_name: code.clone(),
            code,
            priority: 0,
            retry_policy: RetryPolicy::default(),
            step_sequence: Vec::new(),
            failure_classification: FailureClassification::default(),
            step_poll_interval: Duration::from_secs(5),
            step_flag_polarity: StepFlagPolarity::default(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry_policy.max_attempts = max_attempts;
        self
    }

    pub fn with_steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step_sequence = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_failure_classification(mut self, classification: FailureClassification) -> Self {
        self.failure_classification = classification;
        self
    }

    pub fn with_step_poll_interval(mut self, interval: Duration) -> Self {
        self.step_poll_interval = interval;
        self
    }

    pub fn with_step_flag_polarity(mut self, polarity: StepFlagPolarity) -> Self {
        self.step_flag_polarity = polarity;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_policy.max_attempts
    }

    pub fn is_multistep(&self) -> bool {
        !self.step_sequence.is_empty()
    }

    pub fn has_step(&self, step: &str) -> bool {
        self.step_sequence.iter().any(|s| s == step)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.code.trim().is_empty() {
            return Err(DomainError::validation("task type code must not be empty"));
        }
        self.retry_policy.validate()?;

        let mut seen = HashSet::new();
        for step in &self.step_sequence {
            if step.trim().is_empty() {
                return Err(DomainError::validation(format!(
                    "task type '{}' has an empty step name",
                    self.code
                )));
            }
            if !seen.insert(step.as_str()) {
                return Err(DomainError::validation(format!(
                    "task type '{}' repeats step '{step}'",
                    self.code
                )));
            }
        }
        Ok(())
    }
}
