//! Structured logging setup.
//!
//! Log levels:
//! - ERROR: terminal task failures
//! - WARN: retries, model fallbacks, circuit opening
//! - INFO: plan start/finish and cancellation
//! - DEBUG: task state transitions and model selection
//!
//! Debug mode can be enabled with `--debug` or `SITEGEN_DEBUG=1`.
//! `RUST_LOG`, when set, overrides both.

use tracing_subscriber::EnvFilter;

pub const DEBUG_ENV: &str = "SITEGEN_DEBUG";

/// Whether `SITEGEN_DEBUG` asks for debug output.
pub fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Default filter directive when `RUST_LOG` is unset.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Install the global subscriber on stderr. Calling twice is a no-op.
pub fn init(debug: bool) {
    let debug = debug || env_debug();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
