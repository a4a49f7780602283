//! Strongly-typed identifiers used across the work queue.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a persisted work item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItemId(Uuid);

impl WorkItemId {
    /// Create a new identifier.
    ///
    /// Uses UUIDv7 (time-ordered) so ids sort roughly by creation time.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for WorkItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for WorkItemId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<WorkItemId> for Uuid {
    fn from(value: WorkItemId) -> Self {
        value.0
    }
}

impl FromStr for WorkItemId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid =
            Uuid::from_str(s).map_err(|e| DomainError::invalid_id(format!("WorkItemId: {e}")))?;
        Ok(Self(uuid))
    }
}

/// Identity of a worker process, written to `lock_owner` while it holds a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    /// Use an operator-supplied name (e.g. hostname + pid).
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DomainError::invalid_id("WorkerId: empty"));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Generate a unique worker id (`worker-<uuid>`).
    pub fn generate() -> Self {
        Self(format!("worker-{}", Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
