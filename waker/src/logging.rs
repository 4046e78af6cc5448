//! Diagnostic tracing for the `waker` CLI.
//!
//! Tracing goes to stderr and is controlled by `RUST_LOG`. Product output
//! (cycle reports, status JSON, task ids) is printed to stdout by the
//! commands themselves and is unaffected by the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, falling back to `default_directive` when unset.
///
/// # Example
/// ```bash
/// RUST_LOG=waker=debug waker wake
/// ```
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
