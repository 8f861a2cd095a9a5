//! Signature digest check.

use crate::message::domain::Message;
use crate::verification::domain::{RuleDescriptor, RuleViolation};
use crate::verification::ports::ValidationRule;

/// Rejects signed messages whose payload no longer matches the recorded
/// SHA-256 digest. Unsigned messages pass.
#[derive(Debug, Clone)]
pub struct IntegrityValidator {
    descriptor: RuleDescriptor,
}

impl IntegrityValidator {
    /// Creates the validator.
    #[must_use]
    pub const fn new(descriptor: RuleDescriptor) -> Self {
        Self { descriptor }
    }
}

impl ValidationRule for IntegrityValidator {
    fn descriptor(&self) -> &RuleDescriptor {
        &self.descriptor
    }

    fn check(&self, message: &Message) -> Result<(), RuleViolation> {
        match message.signature() {
            Some(block) if !block.matches(message.payload()) => Err(RuleViolation::new(
                &self.descriptor,
                "payload does not match its signature",
            )
            .with_detail(format!("key {} digest {}", block.key_id, block.digest))),
            _ => Ok(()),
        }
    }
}
