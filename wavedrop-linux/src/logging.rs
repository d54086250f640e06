//! Tracing bootstrap for the daemon and CLI.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,wavedrop_core=debug,wavedrop_linux=debug";

/// Initialize the global subscriber. Logs go to stderr so stdout stays clean for tokens and keys.
///
/// Precedence:
/// 1) `RUST_LOG`
/// 2) `WAVEDROP_LOG`
/// 3) internal default filter
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let app_filter = env::var("WAVEDROP_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok());
    if let Some(filter) = app_filter {
        return filter;
    }

    EnvFilter::new(DEFAULT_FILTER)
}
