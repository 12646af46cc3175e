//! `tracing` subscriber setup.

use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::dispatch::{DispatchConfig, LogFormat};

/// Default directive when `RUST_LOG` is unset or invalid.
const DEFAULT_FILTER: &str = "info";

/// Builds a subscriber without installing it: an [`EnvFilter`] read from
/// `RUST_LOG` (falling back to `info`) and a formatter chosen by `format`.
#[must_use]
pub fn subscriber(format: LogFormat) -> Box<dyn Subscriber + Send + Sync> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    layered(format, filter)
}

fn layered(format: LogFormat, filter: EnvFilter) -> Box<dyn Subscriber + Send + Sync> {
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => Box::new(registry.with(fmt::layer().with_target(true))),
        LogFormat::Json => Box::new(registry.with(fmt::layer().json().with_current_span(true))),
    }
}

/// Installs [`subscriber`] as the global default.
///
/// Returns `false` if a global subscriber was already installed, in which case
/// the existing one is left untouched.
pub fn init_tracing(format: LogFormat) -> bool {
    let installed = subscriber(format).try_init();
    if installed.is_err() {
        tracing::debug!("global tracing subscriber already installed");
    }
    installed.is_ok()
}

/// [`init_tracing`] with the format carried by `config`.
pub fn init_tracing_for(config: &DispatchConfig) -> bool {
    init_tracing(config.log_format)
}
