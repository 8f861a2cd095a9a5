//! Validation and sanitization capabilities.

use crate::message::domain::Message;
use crate::verification::domain::{RuleDescriptor, RuleViolation};

/// Decides whether a message may pass.
///
/// Rules are stateless per message and safe to call concurrently.
pub trait ValidationRule: Send + Sync {
    /// Returns the rule's identity and scheduling.
    fn descriptor(&self) -> &RuleDescriptor;

    /// Checks one message.
    ///
    /// # Errors
    ///
    /// Returns [`RuleViolation`] if the message must be refused.
    fn check(&self, message: &Message) -> Result<(), RuleViolation>;
}

/// Rewrites a message into a safer form.
pub trait SanitizationRule: Send + Sync {
    /// Returns the rule's identity and scheduling.
    fn descriptor(&self) -> &RuleDescriptor;

    /// Returns a rewritten message, or `None` if nothing needed to change.
    ///
    /// The rewritten message keeps the original identifier.
    fn transform(&self, message: &Message) -> Option<Message>;
}
