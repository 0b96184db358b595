//! Subscriber setup for tabula's tracing output.
//!
//! Events are emitted under this crate's module targets (`tabula_core::…`):
//! statements at `debug`, transaction boundaries at `info`, drop-time
//! release failures at `warn`. `RUST_LOG` overrides every filter built here.

#[cfg(feature = "logging")]
use tracing_subscriber::{EnvFilter, fmt};

/// Target prefix shared by every tabula event.
pub const TARGET: &str = "tabula_core";

/// Filter directive: tabula at `level`, everything else at `warn`.
#[cfg_attr(not(feature = "logging"), allow(dead_code))]
fn directive(level: &str) -> String {
    format!("warn,{TARGET}={level}")
}

#[cfg(feature = "logging")]
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive(level)))
}

/// Installs a global subscriber logging transaction boundaries.
///
/// ```rust
/// tabula_core::logging::init();
/// ```
#[cfg(feature = "logging")]
pub fn init() {
    init_with_level("info")
}

/// Installs a global subscriber with tabula events at `level`
/// (`trace`, `debug`, `info`, `warn`, `error`).
#[cfg(feature = "logging")]
pub fn init_with_level(level: &str) {
    let _ = fmt()
        .with_env_filter(filter(level))
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .try_init();
}

/// Captures every statement into the test harness output.
#[cfg(feature = "logging")]
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(filter("debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(not(feature = "logging"))]
pub fn init() {}

#[cfg(not(feature = "logging"))]
pub fn init_with_level(_level: &str) {}

#[cfg(not(feature = "logging"))]
pub fn init_test() {}
