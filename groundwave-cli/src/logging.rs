//! Structured logging setup for the CLI.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber. `RUST_LOG` overrides the level
/// chosen by `--verbose`.
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,groundwave_core={default_level},groundwave_cli={default_level}"
        ))
    });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
