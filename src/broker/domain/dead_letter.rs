//! Dead-letter records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Topic;
use crate::message::domain::Message;

/// Prefix used for dead-letter destinations when none is configured.
pub const DEFAULT_DEAD_LETTER_PREFIX: &str = "dead_letter";

/// A message that exhausted its delivery or publish attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The message as it was originally published.
    pub message: Message,
    /// Description of the last failure.
    pub reason: String,
    /// Topic the message was published on.
    pub origin: Topic,
    /// Destination the entry was routed to.
    pub destination: Topic,
    /// When the first failure was observed.
    pub first_failure_at: DateTime<Utc>,
    /// When the final failure was observed.
    pub last_failure_at: DateTime<Utc>,
    /// Number of attempts made before giving up.
    pub attempts: u32,
}

/// Derives the dead-letter destination for an origin topic.
///
/// # Examples
///
/// ```
/// use switchyard::broker::domain::{Topic, dead_letter_destination};
///
/// let destination = dead_letter_destination("dlx", &Topic::new("agents.coder"));
/// assert_eq!(destination.as_str(), "dlx.agents.coder");
/// ```
#[must_use]
pub fn dead_letter_destination(prefix: &str, origin: &Topic) -> Topic {
    Topic::new(format!("{prefix}.{origin}"))
}
