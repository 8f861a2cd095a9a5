//! Errors surfaced by the resilient broker adapter.

use std::time::Duration;

use thiserror::Error;

use super::ports::{DeadLetterError, TransportError};

/// Result type for resilient broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors returned by [`super::services::ResilientBroker`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The circuit breaker rejected the call without touching the transport.
    #[error("circuit open; retry after {retry_after:?}")]
    CircuitOpen {
        /// Time left until the breaker admits a probe.
        retry_after: Duration,
    },

    /// Publishing failed on every attempt; the message was dead-lettered.
    #[error("publish failed after {attempts} attempts: {reason}")]
    TransportExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Last transport failure.
        reason: String,
    },

    /// The rate limiter denied the publish.
    #[error("rate limit exceeded for resource '{resource}'")]
    RateLimited {
        /// Resource whose budget was exhausted.
        resource: String,
    },

    /// Reconnection gave up.
    #[error("reconnection failed after {attempts} attempts")]
    ReconnectFailed {
        /// Number of connection attempts made.
        attempts: u32,
    },

    /// The subscription is not known to the adapter.
    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    /// The adapter has been closed.
    #[error("broker adapter is closed")]
    Closed,

    /// A non-retryable transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The dead-letter sink rejected an entry.
    #[error(transparent)]
    DeadLetter(#[from] DeadLetterError),
}
