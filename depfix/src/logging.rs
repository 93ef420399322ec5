//! Diagnostic tracing for depfix.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. Product output
//! (session summaries, patched manifests) goes to stdout, and per-attempt
//! artifacts go to `--report-dir`; neither depends on the log level.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`, so oracle fallbacks and tolerated
/// failures are visible without extra flags.
///
/// # Example
/// ```bash
/// RUST_LOG=depfix=debug depfix remediate --manifest requirements.txt ...
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
