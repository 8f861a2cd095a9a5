//! Agent-to-agent delivery over the resilient broker.
//!
//! [`DeliveryBus`] owns recipient registration, groups and the
//! acknowledgment records of in-flight messages. Inbound deliveries pass
//! the duplicate filter and the sequence tracker before a
//! [`RecipientHandler`] sees them; the handler's result decides whether the
//! delivery is acknowledged or rejected.

mod ack;
mod bus;
mod error;
mod handler;

pub use ack::{AckOutcome, AcknowledgmentRecord};
pub use bus::{BusSettings, DEFAULT_SWEEP_INTERVAL, DEFAULT_TOPIC_PREFIX, DeliveryBus};
pub use error::BusError;
pub use handler::{HandlerError, RecipientHandler};

#[cfg(test)]
pub(crate) mod tests;
