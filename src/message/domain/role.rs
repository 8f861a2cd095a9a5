//! Role tag carried by every message.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The role of the party that produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Infrastructure-generated messages such as rejection notices.
    System,
    /// A human user, relayed by an agent.
    User,
    /// An autonomous agent.
    #[default]
    Assistant,
    /// Output of a tool invocation.
    Tool,
}

impl Role {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Error returned when a role tag is not recognised.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown message role: {0}")]
pub struct ParseRoleError(pub String);

impl TryFrom<&str> for Role {
    type Error = ParseRoleError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            _ => Err(ParseRoleError(value.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("system", Role::System)]
    #[case(" USER ", Role::User)]
    #[case("Assistant", Role::Assistant)]
    #[case("tool", Role::Tool)]
    fn parses_known_roles(#[case] raw: &str, #[case] expected: Role) {
        assert_eq!(Role::try_from(raw), Ok(expected));
    }

    #[test]
    fn rejects_unknown_role() {
        assert_eq!(
            Role::try_from("oracle"),
            Err(ParseRoleError("oracle".to_owned()))
        );
    }
}
