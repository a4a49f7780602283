//! Distributed work queue with lease-based scheduling.
//!
//! ## Design
//!
//! - Work items live in one shared table; workers coordinate only through it
//! - A claim is a single conditional update; expired leases are reclaimable
//! - Classified failures spend an attempt budget, step progress does not
//! - Multistep items checkpoint the current step and payload between leases
//! - Recurring items are re-armed from their schedule after each success
//!
//! ## Components
//!
//! - `WorkItemStore`: persistence (in-memory or PostgreSQL)
//! - `LeaseManager`: claim, renew and release
//! - `HandlerRegistry`: work type -> handler
//! - `SchedulingTrigger`: arms recurring items
//! - `Dispatcher`: the per-worker poll/claim/execute/release loop
//! - `WorkItemAdmin`: operations for the surrounding application

pub mod admin;
pub mod dispatcher;
pub mod lease;
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod store;
pub mod trigger;

pub use admin::{AdminError, NewWorkItem, WorkItemAdmin};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats};
pub use lease::{Claim, ClaimResult, LeaseManager, ReleaseOutcome};
pub use memory::InMemoryWorkItemStore;
pub use postgres::PostgresWorkItemStore;
pub use registry::{
    HandlerRegistry, RegisteredHandler, Registration, RegistryError, StepHandler, WorkHandler,
};
pub use store::{ClaimedRow, StoreError, WorkItemFilter, WorkItemStats, WorkItemStore};
pub use trigger::SchedulingTrigger;
