// Logging
//
// tracing subscriber for the binary. Everything goes to stderr: stdout
// carries nothing but STATE lines.

use std::io::IsTerminal;

use tracing_subscriber::{fmt, EnvFilter};

/// Map a Singer-style level name onto a tracing directive.
pub fn level_directive(level: &str) -> &'static str {
    match level.to_ascii_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARNING" | "WARN" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}

/// Install the global subscriber. `RUST_LOG` wins over `level`.
pub fn init_logging(level: &str) {
    let directive = level_directive(level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("bqtarget={directive},bqtarget_kernel={directive}"))
    });

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(false)
        .init();
}
