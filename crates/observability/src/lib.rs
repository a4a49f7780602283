//! Tracing and logging setup shared by worker binaries.

/// Initialize process-wide logging.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Subscriber configuration (format, filters).
pub mod tracing;
