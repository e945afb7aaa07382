//! Tracing subscriber initialization.

use tracing_subscriber::EnvFilter;

/// Initialize logging from `RUST_LOG`, defaulting to info with debug
/// detail for the daemon itself.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,cricketd=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
