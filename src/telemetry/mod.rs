//! Tracing subscriber installation for host binaries and tests.
//!
//! Library code only emits `tracing` events; installing a subscriber is
//! left to whoever embeds the crate. [`init_tracing`] is the stock choice:
//! a formatted layer filtered by `RUST_LOG`, falling back to the given
//! directives.

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Filter applied when `RUST_LOG` is unset and no directives are given.
pub const DEFAULT_FILTER: &str = "switchyard=info";

/// Errors raised while installing the subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The filter directives do not parse.
    #[error("invalid log filter {filter:?}: {reason}")]
    Filter {
        /// Directives as given.
        filter: String,
        /// Parser message.
        reason: String,
    },

    /// A global subscriber is already installed.
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Builds the filter: `RUST_LOG` if set and valid, otherwise `directives`.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] if `directives` do not parse.
pub fn env_filter(directives: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(directives).map_err(|error| TelemetryError::Filter {
            filter: directives.to_owned(),
            reason: error.to_string(),
        })
    })
}

/// Installs a global formatted subscriber.
///
/// # Errors
///
/// Returns [`TelemetryError::Filter`] for bad directives or
/// [`TelemetryError::AlreadyInstalled`] if a subscriber is already set.
pub fn init_tracing(directives: &str) -> Result<(), TelemetryError> {
    let filter = env_filter(directives)?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .map_err(|error| TelemetryError::AlreadyInstalled(error.to_string()))
}
