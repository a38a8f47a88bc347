//! Shared `tracing` initialization, identical across all three binaries so
//! `RUST_LOG` behaves the same way no matter which service you are running.

/// Installs a `tracing-subscriber` formatting layer honoring `RUST_LOG`,
/// defaulting to `info` when the variable is unset or invalid.
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
