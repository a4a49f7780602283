//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures of the work-queue model (validation, invariants,
/// illegal transitions). Storage and transport concerns belong to infra.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The item's step is not part of its type's step sequence.
    #[error("unknown step '{step}' for type '{work_type}'")]
    UnknownStep { work_type: String, step: String },

    /// A status transition that the lifecycle does not allow.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// A schedule expression could not be evaluated.
    #[error("invalid schedule: {0}")]
    Schedule(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn unknown_step(work_type: impl Into<String>, step: impl Into<String>) -> Self {
        Self::UnknownStep {
            work_type: work_type.into(),
            step: step.into(),
        }
    }

    pub fn invalid_transition(msg: impl Into<String>) -> Self {
        Self::InvalidTransition(msg.into())
    }

    pub fn schedule(msg: impl Into<String>) -> Self {
        Self::Schedule(msg.into())
    }
}
