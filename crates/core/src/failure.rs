//! Failure taxonomy: what handlers report and how a task type classifies it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a handler failure is treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient; re-queued with backoff while the attempt budget lasts.
    Retryable,
    /// Terminal on first occurrence.
    Fatal,
}

/// Why an item ended up with an error recorded against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Retryable,
    Fatal,
    /// A retryable failure that exhausted the attempt budget.
    Poison,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Retryable => "retryable",
            FailureClass::Fatal => "fatal",
            FailureClass::Poison => "poison",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "retryable" => Some(FailureClass::Retryable),
            "fatal" => Some(FailureClass::Fatal),
            "poison" => Some(FailureClass::Poison),
            _ => None,
        }
    }
}

/// Error returned by a handler.
///
/// `code` is a stable, machine-readable error name (the equivalent of an
/// exception type) matched against the task type's retryable/fatal sets.
/// An explicit `kind` wins over that lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
    pub kind: Option<FailureKind>,
}

impl HandlerError {
    /// Unclassified error; the task type decides (fail closed when unknown).
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            kind: None,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            code: "retryable".to_string(),
            message: message.into(),
            kind: Some(FailureKind::Retryable),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            code: "fatal".to_string(),
            message: message.into(),
            kind: Some(FailureKind::Fatal),
        }
    }

    pub fn with_kind(mut self, kind: FailureKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// Error-code sets used to classify unlabelled handler errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureClassification {
    pub retryable_on: BTreeSet<String>,
    pub fatal_on: BTreeSet<String>,
}

impl FailureClassification {
    pub fn retryable_on<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_on.extend(codes.into_iter().map(Into::into));
        self
    }

    pub fn fatal_on<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fatal_on.extend(codes.into_iter().map(Into::into));
        self
    }

    /// Explicit kind, then `fatal_on`, then `retryable_on`, otherwise fatal.
    pub fn classify(&self, err: &HandlerError) -> FailureKind {
        if let Some(kind) = err.kind {
            return kind;
        }
        if self.fatal_on.contains(&err.code) {
            return FailureKind::Fatal;
        }
        if self.retryable_on.contains(&err.code) {
            return FailureKind::Retryable;
        }
        FailureKind::Fatal
    }
}
