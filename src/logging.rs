//! Tracing subscriber installation
//!
//! `RUST_LOG` takes precedence; otherwise `PYTHON_DEBUG` picks the level
//! (`DEBUG` or `1`, `INFO`, `WARN`, `ERROR`), defaulting to `info`.

use tracing_subscriber::EnvFilter;

/// Map a `PYTHON_DEBUG` value onto a filter directive
pub fn level_from_hint(hint: Option<&str>) -> &'static str {
    match hint.map(|h| h.trim().to_ascii_uppercase()).as_deref() {
        Some("DEBUG") | Some("1") => "debug",
        Some("WARN") | Some("WARNING") => "warn",
        Some("ERROR") => "error",
        _ => "info",
    }
}

/// Install the fmt subscriber; later calls are no-ops
pub fn init() {
    let hint = std::env::var("PYTHON_DEBUG").ok();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_from_hint(hint.as_deref())));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_test_writer()
        .try_init();
}
