//! Results of running a message through the pipeline.

use serde::Serialize;

use super::RuleViolation;
use crate::message::domain::{Message, MessageId};

/// Why a message was refused, in terms safe to show its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// Refused message.
    pub message_id: MessageId,
    /// Rule that refused it.
    pub rule: String,
    /// Public summary of the failure.
    pub reason: String,
}

impl Rejection {
    /// Builds the public view of a violation.
    #[must_use]
    pub fn from_violation(message_id: MessageId, violation: &RuleViolation) -> Self {
        Self {
            message_id,
            rule: violation.rule.clone(),
            reason: violation.reason.clone(),
        }
    }
}

/// Decision of [`crate::verification::VerificationPipeline::process`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Every validator passed and no sanitizer changed the message.
    Accepted(Message),
    /// A validator refused the message; it must not be delivered.
    Rejected(Rejection),
    /// Every validator passed and sanitizers rewrote the message.
    Sanitized(Message),
}

impl Outcome {
    /// Returns the deliverable message, if any.
    #[must_use]
    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::Accepted(message) | Self::Sanitized(message) => Some(message),
            Self::Rejected(_) => None,
        }
    }
}

/// Detailed report of a verification run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    /// `true` if every enabled validator passed.
    pub valid: bool,
    /// `(rule, reason)` pairs in the order they were reported.
    pub errors: Vec<(String, String)>,
    /// Sanitized message, present only when sanitizers changed it.
    pub sanitized: Option<Message>,
}
