//! Development-time tracing for debugging pipeline runs.
//!
//! Diagnostics only: controlled by `RUST_LOG`, written to stderr, never
//! persisted. Durable run history lives in the job event log and the
//! persisted project/job records, unaffected by this module.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; defaults to `warn` when unset. Compact format on
/// stderr.
///
/// # Example
/// ```bash
/// RUST_LOG=pipeline=debug pipeline run --project-id <id>
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
