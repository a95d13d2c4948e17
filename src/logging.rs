//! Ready-made subscriber for binaries driving a [`Scheduler`](crate::Scheduler).

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

/// Installs a global subscriber: log lines filtered by `RUST_LOG` (default
/// `info`), with one progress bar per running task drawn underneath them.
pub fn init() -> Result<(), TryInitError> {
    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()
}
