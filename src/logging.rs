use std::io::{self, IsTerminal};

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "CLAWUP_LOG";

/// Install the global subscriber. Diagnostics go to stderr; stdout is reserved
/// for command output.
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_target(false)
        .try_init();
}
