//! Rule identity and rule failures.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Identity and scheduling of a rule.
///
/// Rules run in ascending `priority`; disabled rules are skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDescriptor {
    /// Name reported in results and events.
    pub name: String,
    /// Lower runs first.
    pub priority: i32,
    /// Whether the rule takes part in verification.
    pub enabled: bool,
}

impl RuleDescriptor {
    /// Creates an enabled descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            enabled: true,
        }
    }

    /// Returns the descriptor with `enabled` replaced.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// A validation failure.
///
/// `reason` is a public summary safe to return to the sender. `detail`
/// names the rule internals (the matching pattern, the offending field)
/// and is only logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{rule}: {reason}")]
pub struct RuleViolation {
    /// Failing rule.
    pub rule: String,
    /// Public summary.
    pub reason: String,
    /// Internal detail for operators.
    pub detail: Option<String>,
}

impl RuleViolation {
    /// Creates a violation reported by `rule`.
    #[must_use]
    pub fn new(rule: &RuleDescriptor, reason: impl Into<String>) -> Self {
        Self {
            rule: rule.name.clone(),
            reason: reason.into(),
            detail: None,
        }
    }

    /// Attaches operator-only detail.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// JSON value kinds a schema can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonKind {
    /// Any value, including null.
    Any,
    /// A string.
    String,
    /// A number.
    Number,
    /// A boolean.
    Bool,
    /// An object.
    Object,
    /// An array.
    Array,
    /// Null.
    Null,
}

impl JsonKind {
    /// Returns the kind of a JSON value.
    #[must_use]
    pub const fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Bool,
            Value::Number(_) => Self::Number,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    /// Returns `true` if `value` is of this kind.
    #[must_use]
    pub fn admits(self, value: &Value) -> bool {
        self == Self::Any || self == Self::of(value)
    }

    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::Object => "object",
            Self::Array => "array",
            Self::Null => "null",
        }
    }
}

impl fmt::Display for JsonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
