//! Sender-to-recipient access decisions supplied by an external
//! access-control collaborator.

#[cfg(test)]
use mockall::automock;

use crate::message::domain::AgentId;

/// Recipient entry matching every recipient of a sender.
pub const WILDCARD: &str = "*";

/// Lookup table of allow/deny decisions.
#[cfg_attr(test, automock)]
pub trait AccessTable: Send + Sync {
    /// Returns the recorded decision for `sender` writing to `recipient`,
    /// or `None` if the table has no entry for the pair.
    ///
    /// Callers look up [`WILDCARD`] as the recipient to find a sender's
    /// fallback entry.
    fn decision(&self, sender: &AgentId, recipient: &AgentId) -> Option<bool>;
}
