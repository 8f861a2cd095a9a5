//! Deliveries handed to subscribers.

use serde::{Deserialize, Serialize};

use super::{DeliveryId, Topic};
use crate::message::domain::Message;

/// One delivery of a message to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Broker-issued delivery identifier, stable across redeliveries.
    pub id: DeliveryId,
    /// Topic the message was published on.
    pub topic: Topic,
    /// The delivered message.
    pub message: Message,
    /// 1-based delivery attempt counter.
    pub attempt: u32,
}

impl Delivery {
    /// Creates a first-attempt delivery.
    #[must_use]
    pub const fn first(id: DeliveryId, topic: Topic, message: Message) -> Self {
        Self {
            id,
            topic,
            message,
            attempt: 1,
        }
    }

    /// Returns the redelivery of this delivery with the attempt incremented.
    #[must_use]
    pub fn redelivered(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

/// What happened to a negatively acknowledged delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NackDisposition {
    /// The delivery was returned to the queue for another attempt.
    Requeued,
    /// The delivery exhausted its attempts and was dead-lettered.
    DeadLettered,
}
