//! Log subscriber setup

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,nuxeo_operator=debug,kube=info";

/// Install the global subscriber: JSON lines with the current span, filtered by
/// `RUST_LOG`
///
/// Fails if a global subscriber is already set.
pub fn init_telemetry() -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(fmt::layer().json().with_current_span(true))
        .with(filter)
        .try_init()
}
