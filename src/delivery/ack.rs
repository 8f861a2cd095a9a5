//! Acknowledgment bookkeeping for in-flight messages.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::domain::{Delivery, DeliveryId};
use crate::message::domain::MessageId;

/// Where a message stands in its acknowledgment lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckOutcome {
    /// Published or received, not yet settled.
    Pending,
    /// Acknowledged by the recipient side.
    Acked,
    /// Rejected and requeued; awaiting redelivery.
    Nacked,
}

impl AckOutcome {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acked => "acked",
            Self::Nacked => "nacked",
        }
    }
}

impl fmt::Display for AckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery state of one message, owned by the delivery bus.
///
/// A record lives from `send` (or first receipt) until the message is
/// acknowledged or dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgmentRecord {
    /// Message being tracked.
    pub message_id: MessageId,
    /// Most recent broker delivery of the message, once the broker
    /// accepted it.
    pub delivery_id: Option<DeliveryId>,
    /// Delivery attempts observed so far.
    pub attempts: u32,
    /// Time of the most recent publish or delivery attempt.
    pub last_attempt_at: DateTime<Utc>,
    /// Current outcome.
    pub outcome: AckOutcome,
    /// Detail of the last rejection.
    pub nack_reason: Option<String>,
}

impl AcknowledgmentRecord {
    /// Creates a record for a message about to be published.
    #[must_use]
    pub const fn pending(message_id: MessageId, now: DateTime<Utc>) -> Self {
        Self {
            message_id,
            delivery_id: None,
            attempts: 0,
            last_attempt_at: now,
            outcome: AckOutcome::Pending,
            nack_reason: None,
        }
    }

    /// Notes a delivery attempt.
    pub fn observe(&mut self, delivery: &Delivery, now: DateTime<Utc>) {
        self.delivery_id = Some(delivery.id.clone());
        self.attempts = self.attempts.max(delivery.attempt);
        self.last_attempt_at = now;
        if self.outcome == AckOutcome::Nacked {
            self.outcome = AckOutcome::Pending;
        }
    }

    /// Notes a requeueing rejection.
    pub fn reject(&mut self, reason: &str) {
        self.outcome = AckOutcome::Nacked;
        self.nack_reason = Some(reason.to_owned());
    }
}
