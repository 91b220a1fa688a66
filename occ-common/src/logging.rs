//! Logging initialization for the occ binaries.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber, writing to stderr.
///
/// The filter honors `OCC_LOG` when set, falling back to `default_level`.
/// Call once per process; later calls are ignored.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_env("OCC_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
