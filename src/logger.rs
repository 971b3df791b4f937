//! Logging setup for the binary and demos.

use tracing::Level;

/// Initialize the tracing subscriber with the default INFO level.
///
/// The level can be overridden with `RUST_LOG`, e.g.
/// `RUST_LOG=vio_landmarks=debug`.
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Initialize the tracing subscriber with a custom default level.
pub fn init_logger_with_level(default_level: Level) {
    use tracing_subscriber::fmt::time::SystemTime;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(default_level.into())
                .from_env_lossy(),
        )
        .with_timer(SystemTime)
        .with_target(true)
        .with_level(true)
        .with_thread_names(true)
        .init();
}
