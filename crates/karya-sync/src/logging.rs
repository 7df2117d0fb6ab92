//! Log output for the daemon.

/// Initialize the tracing subscriber with environment filter support.
///
/// Logs at INFO level and above by default. Override with `RUST_LOG`:
///
/// ```bash
/// RUST_LOG=debug karya-syncd
/// RUST_LOG=karya_sync_engine=debug,karya_sync_store=warn karya-syncd
/// ```
///
/// Calling this more than once is harmless; later calls are ignored.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
