//! Infrastructure layer: work-item stores, leasing, dispatch, config.

pub mod config;
pub mod queue;

mod integration_tests;
