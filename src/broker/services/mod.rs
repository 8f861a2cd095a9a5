//! Services layered over the broker port.

mod backoff;
mod circuit_breaker;
mod resilient;

pub use backoff::{BackoffPolicy, JitterPolicy, RetrySchedule};
pub use circuit_breaker::{CircuitBreaker, CircuitPermit};
pub use resilient::{BrokerSettings, ResilientBroker};
