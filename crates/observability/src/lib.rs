//! Process-wide tracing setup shared by jobflow binaries.

/// Initialize tracing for the process with JSON output.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::Json);
}

/// Subscriber construction (filters, output format).
pub mod tracing;
