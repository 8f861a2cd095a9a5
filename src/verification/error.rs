//! Errors of the verification context.

use thiserror::Error;

use crate::delivery::BusError;
use crate::message::domain::MessageBuilderError;
use crate::verification::domain::Rejection;

/// A rule set could not be built from its specification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleConfigError {
    /// A pattern failed to compile.
    #[error("rule {rule}: invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// Rule owning the pattern.
        rule: String,
        /// Offending pattern.
        pattern: String,
        /// Compiler message.
        reason: String,
    },

    /// A parameter is out of range.
    #[error("rule {rule}: {reason}")]
    InvalidParameter {
        /// Rule owning the parameter.
        rule: String,
        /// What is wrong.
        reason: String,
    },

    /// A custom rule kind has no registered factory.
    #[error("unknown rule kind: {0}")]
    UnknownKind(String),

    /// Two rules share a name.
    #[error("duplicate rule name: {0}")]
    DuplicateName(String),
}

impl RuleConfigError {
    pub(crate) fn pattern(rule: &str, pattern: &str, error: &regex::Error) -> Self {
        Self::InvalidPattern {
            rule: rule.to_owned(),
            pattern: pattern.to_owned(),
            reason: error.to_string(),
        }
    }
}

/// Errors returned by [`crate::verification::VerificationGate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// The message failed verification and was not sent.
    #[error("message {} rejected: {}", .0.message_id, .0.reason)]
    Rejected(Rejection),

    /// The verified message could not be sent.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// The rejection notice template failed to render.
    #[error("rejection notice template: {0}")]
    Template(String),

    /// The rejection notice could not be built.
    #[error("rejection notice: {0}")]
    Notice(#[from] MessageBuilderError),
}
