//! Port definitions for the broker layer.

pub mod broker;
pub mod dead_letter;

pub use broker::{BrokerPort, DeliveryHandler, TransportError, TransportResult};
pub use dead_letter::{DeadLetterError, DeadLetterSink};
