//! Port for the external durable transport.
//!
//! Implementations provide at-least-once publish/subscribe with explicit
//! acknowledgement. The resilient adapter layers circuit breaking,
//! reconnection and dead-lettering on top of this contract.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::broker::domain::{ChannelStatus, Delivery, DeliveryId, SubscriptionId, Topic};
use crate::message::domain::Message;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Receives deliveries for a subscription.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Handles one delivery.
    ///
    /// The handler is responsible for acknowledging or rejecting the
    /// delivery through the broker.
    async fn handle(&self, delivery: Delivery);
}

/// Port for a publish/subscribe transport with acknowledgements.
#[async_trait]
pub trait BrokerPort: Send + Sync {
    /// Establishes the connection.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionLost`] if the transport is
    /// unreachable.
    async fn connect(&self) -> TransportResult<()>;

    /// Returns `true` while the connection is open.
    async fn is_connected(&self) -> bool;

    /// Publishes a message on a topic.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the publish was not accepted.
    async fn publish(&self, topic: &Topic, message: &Message) -> TransportResult<DeliveryId>;

    /// Registers a handler for a topic.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the subscription was not established.
    async fn subscribe(
        &self,
        topic: &Topic,
        handler: Arc<dyn DeliveryHandler>,
    ) -> TransportResult<SubscriptionId>;

    /// Removes a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnknownSubscription`] if the id is not active.
    async fn unsubscribe(&self, subscription: &SubscriptionId) -> TransportResult<()>;

    /// Positively acknowledges a delivery.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnknownDelivery`] if the delivery is not
    /// outstanding.
    async fn ack(&self, delivery: &DeliveryId) -> TransportResult<()>;

    /// Negatively acknowledges a delivery, optionally requeueing it.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnknownDelivery`] if the delivery is not
    /// outstanding.
    async fn nack(&self, delivery: &DeliveryId, requeue: bool) -> TransportResult<()>;

    /// Reports the status of each transport channel.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the status cannot be read.
    async fn channels(&self) -> TransportResult<Vec<ChannelStatus>>;

    /// Closes the connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the close handshake failed.
    async fn close(&self) -> TransportResult<()>;
}

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection dropped or could not be established.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// A recoverable failure such as a timeout.
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// The delivery is not outstanding.
    #[error("unknown delivery: {0}")]
    UnknownDelivery(DeliveryId),

    /// The subscription is not active.
    #[error("unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),
}

impl TransportError {
    /// Returns `true` for failures that count against the circuit breaker
    /// and may succeed on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Transient(_))
    }

    /// Returns `true` if the connection must be re-established.
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}
