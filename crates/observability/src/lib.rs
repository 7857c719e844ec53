//! Tracing/logging setup shared by every binary.

pub mod subscriber;

pub use subscriber::{LogFormat, TracingConfig};

/// Initialize process-wide tracing with JSON output and `RUST_LOG` filtering.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init(&TracingConfig::default());
}
