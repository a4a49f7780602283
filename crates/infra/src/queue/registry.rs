//! Handler registry: task type code -> handler implementation.
//!
//! Populated at process start. Lookup tries the exact code, then `prefix.*`
//! category patterns, then the `*` fallback. A type nothing resolves for is a
//! configuration error that the dispatcher fails as fatal.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use workforge_core::{DomainError, HandlerError, StepDescriptor, StepResult, TaskType, WorkItem};

/// Single-shot handler.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn execute(&self, item: &WorkItem) -> Result<(), HandlerError>;
}

/// Multistep handler, invoked once per leased execution with the current step.
///
/// `payload` starts as the persisted payload. Mutations are persisted when the
/// step returns `Ok`, and discarded when it returns an error.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute_step(
        &self,
        item: &WorkItem,
        step: &StepDescriptor,
        payload: &mut serde_json::Value,
    ) -> Result<StepResult, HandlerError>;
}

#[derive(Clone)]
pub enum RegisteredHandler {
    Single(Arc<dyn WorkHandler>),
    Multistep(Arc<dyn StepHandler>),
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisteredHandler::Single(_) => f.write_str("Single"),
            RegisteredHandler::Multistep(_) => f.write_str("Multistep"),
        }
    }
}

/// A task type together with its handler.
#[derive(Debug, Clone)]
pub struct Registration {
    pub task_type: TaskType,
    pub handler: RegisteredHandler,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no handler registered for work type '{0}'")]
    UnknownType(String),
    #[error("work type '{0}' is already registered")]
    Duplicate(String),
    #[error("work type '{code}': {reason}")]
    KindMismatch { code: String, reason: String },
    #[error(transparent)]
    InvalidType(#[from] DomainError),
}

/// Adapter for plain async closures.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> WorkHandler for FnHandler<F>
where
    F: Fn(WorkItem) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn execute(&self, item: &WorkItem) -> Result<(), HandlerError> {
        (self.0)(item.clone()).await
    }
}

#[derive(Debug, Default, Clone)]
pub struct HandlerRegistry {
    entries: HashMap<String, Registration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a single-shot handler. `task_type.code` may be an exact
    /// code, a `prefix.*` pattern or `*`.
    pub fn register(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn WorkHandler>,
    ) -> Result<(), RegistryError> {
        if task_type.is_multistep() {
            return Err(RegistryError::KindMismatch {
                code: task_type.code,
                reason: "declares steps but the handler is single-shot".to_string(),
            });
        }
        self.insert(task_type, RegisteredHandler::Single(handler))
    }

    /// Register a multistep handler. The type must declare its steps.
    pub fn register_steps(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn StepHandler>,
    ) -> Result<(), RegistryError> {
        if !task_type.is_multistep() {
            return Err(RegistryError::KindMismatch {
                code: task_type.code,
                reason: "multistep handler needs a step sequence".to_string(),
            });
        }
        self.insert(task_type, RegisteredHandler::Multistep(handler))
    }

    /// Register an async closure as a single-shot handler.
    pub fn register_fn<F, Fut>(&mut self, task_type: TaskType, f: F) -> Result<(), RegistryError>
    where
        F: Fn(WorkItem) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.register(task_type, Arc::new(FnHandler(f)))
    }

    fn insert(&mut self, task_type: TaskType, handler: RegisteredHandler) -> Result<(), RegistryError> {
        task_type.validate()?;
        if self.entries.contains_key(&task_type.code) {
            return Err(RegistryError::Duplicate(task_type.code));
        }
        self.entries.insert(
            task_type.code.clone(),
            Registration { task_type, handler },
        );
        Ok(())
    }

    /// Resolve the registration for a work item's type.
    pub fn resolve(&self, work_type: &str) -> Result<&Registration, RegistryError> {
        if let Some(entry) = self.entries.get(work_type) {
            return Ok(entry);
        }

        // Longest matching category wins.
        let category = self
            .entries
            .iter()
            .filter_map(|(pattern, entry)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = work_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), entry))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, entry)| entry);
        if let Some(entry) = category {
            return Ok(entry);
        }

        self.entries
            .get("*")
            .ok_or_else(|| RegistryError::UnknownType(work_type.to_string()))
    }

    pub fn contains(&self, work_type: &str) -> bool {
        self.resolve(work_type).is_ok()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
