//! Access table held in memory and loadable from configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::domain::AgentId;
use crate::verification::ports::{AccessTable, WILDCARD};

/// Fixed table of decisions keyed by sender, then recipient.
///
/// ```json
/// { "planner": { "coder": true, "*": false } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticAccessTable {
    entries: BTreeMap<AgentId, BTreeMap<AgentId, bool>>,
}

impl StaticAccessTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `sender` may message `recipient`.
    #[must_use]
    pub fn allow(self, sender: impl Into<AgentId>, recipient: impl Into<AgentId>) -> Self {
        self.with_decision(sender, recipient, true)
    }

    /// Records that `sender` may not message `recipient`.
    #[must_use]
    pub fn deny(self, sender: impl Into<AgentId>, recipient: impl Into<AgentId>) -> Self {
        self.with_decision(sender, recipient, false)
    }

    /// Records a decision for every recipient `sender` has no entry for.
    #[must_use]
    pub fn default_for(self, sender: impl Into<AgentId>, allowed: bool) -> Self {
        self.with_decision(sender, WILDCARD, allowed)
    }

    fn with_decision(
        mut self,
        sender: impl Into<AgentId>,
        recipient: impl Into<AgentId>,
        allowed: bool,
    ) -> Self {
        self.entries
            .entry(sender.into())
            .or_default()
            .insert(recipient.into(), allowed);
        self
    }
}

impl AccessTable for StaticAccessTable {
    fn decision(&self, sender: &AgentId, recipient: &AgentId) -> Option<bool> {
        self.entries.get(sender)?.get(recipient).copied()
    }
}
