//! Logging setup: verbosity-driven `EnvFilter`, `RUST_LOG` override honored
//! when set.

use tracing_subscriber::EnvFilter;

/// Builds the log level string for a given `-v` count, matching the
/// convention of each additional flag widening the default filter.
fn level_for_verbosity(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

pub fn init(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for_verbosity(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
