//! Errors of runtime assembly and reconfiguration.

use thiserror::Error;

use crate::broker::error::BrokerError;
use crate::config::ConfigError;
use crate::delivery::BusError;
use crate::verification::{GateError, RuleConfigError};

/// Errors returned by [`super::SwitchyardRuntime`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The verification rules do not build.
    #[error(transparent)]
    Rules(#[from] RuleConfigError),

    /// The rejection notice template does not parse.
    #[error(transparent)]
    Gate(#[from] GateError),

    /// The broker could not connect.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// The bus could not be closed.
    #[error(transparent)]
    Bus(#[from] BusError),
}
