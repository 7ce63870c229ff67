//! Tracing initialization for foreground and background modes.

use std::path::Path;

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

/// Rolling sync log file name prefix; the appender adds the date suffix.
pub const SYNC_LOG_PREFIX: &str = "comms-sync.log";

fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default))
}

/// Initialize tracing for foreground (terminal) runs.
pub fn init_foreground(debug: bool) {
    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

/// Initialize tracing for background runs: a daily-rolling `comms-sync.log`
/// in the data directory, no ANSI.
pub fn init_background(log_dir: &Path, debug: bool) {
    let file_appender = tracing_appender::rolling::daily(log_dir, SYNC_LOG_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard so the non-blocking writer lives for the entire process.
    std::mem::forget(guard);

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .compact(),
        )
        .init();
}
