//! Sender-to-recipient permission lookup.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::message::domain::{AgentId, Message};
use crate::verification::domain::{RuleDescriptor, RuleViolation};
use crate::verification::ports::{AccessTable, ValidationRule, WILDCARD};

/// Parameters of [`PermissionValidator`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionParams {
    /// Decision when neither the pair nor the sender's wildcard is listed.
    pub default_allow: bool,
}

/// Rejects messages the access table does not permit.
///
/// Lookup order: the exact `(sender, recipient)` pair, then the sender's
/// `*` entry, then the configured default.
pub struct PermissionValidator {
    descriptor: RuleDescriptor,
    table: Arc<dyn AccessTable>,
    default_allow: bool,
}

impl PermissionValidator {
    /// Creates the validator.
    #[must_use]
    pub fn new(
        descriptor: RuleDescriptor,
        table: Arc<dyn AccessTable>,
        params: PermissionParams,
    ) -> Self {
        Self {
            descriptor,
            table,
            default_allow: params.default_allow,
        }
    }
}

impl ValidationRule for PermissionValidator {
    fn descriptor(&self) -> &RuleDescriptor {
        &self.descriptor
    }

    fn check(&self, message: &Message) -> Result<(), RuleViolation> {
        let sender = message.sender();
        let recipient = message.recipient();
        let exact = self.table.decision(sender, recipient);
        let decision = exact
            .or_else(|| self.table.decision(sender, &AgentId::from(WILDCARD)))
            .unwrap_or(self.default_allow);
        if decision {
            return Ok(());
        }
        let detail = match exact {
            Some(_) => format!("{sender} explicitly denied for {recipient}"),
            None => format!("{sender} has no entry for {recipient}"),
        };
        Err(RuleViolation::new(
            &self.descriptor,
            format!("sender {sender} may not message {recipient}"),
        )
        .with_detail(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::verification::ports::MockAccessTable;
    use mockall::predicate::eq;
    use serde_json::json;

    fn message() -> Message {
        Message::builder("planner", "coder")
            .with_json(json!({}))
            .build(&ManualClock::default())
            .expect("valid message")
    }

    #[test]
    fn exact_entry_wins() {
        let mut table = MockAccessTable::new();
        table
            .expect_decision()
            .with(eq(AgentId::from("planner")), eq(AgentId::from("coder")))
            .times(1)
            .return_const(Some(true));
        let validator = PermissionValidator::new(
            RuleDescriptor::new("permission", 40),
            Arc::new(table),
            PermissionParams::default(),
        );

        assert_eq!(validator.check(&message()), Ok(()));
    }

    #[test]
    fn wildcard_entry_is_the_fallback() {
        let mut table = MockAccessTable::new();
        table
            .expect_decision()
            .with(eq(AgentId::from("planner")), eq(AgentId::from("coder")))
            .return_const(None);
        table
            .expect_decision()
            .with(eq(AgentId::from("planner")), eq(AgentId::from(WILDCARD)))
            .times(1)
            .return_const(Some(false));
        let validator = PermissionValidator::new(
            RuleDescriptor::new("permission", 40),
            Arc::new(table),
            PermissionParams {
                default_allow: true,
            },
        );

        let violation = validator.check(&message()).expect_err("must be rejected");

        assert_eq!(violation.reason, "sender planner may not message coder");
    }

    #[test]
    fn default_applies_without_entries() {
        let mut table = MockAccessTable::new();
        table.expect_decision().return_const(None);
        let validator = PermissionValidator::new(
            RuleDescriptor::new("permission", 40),
            Arc::new(table),
            PermissionParams {
                default_allow: true,
            },
        );

        assert_eq!(validator.check(&message()), Ok(()));
    }
}
