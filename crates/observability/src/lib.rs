//! Process-wide tracing setup shared by the vidflow binaries.

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Subscriber configuration (filter, output format).
pub mod tracing;
