//! Process-wide tracing setup shared by the binaries.

pub mod tracing;

pub use crate::tracing::LogFormat;

/// Initialize tracing from `RUST_LOG` and `LOG_FORMAT`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let format = std::env::var("LOG_FORMAT")
        .map(|v| LogFormat::parse(&v))
        .unwrap_or_default();
    tracing::init(format);
}
