//! In-memory implementation of [`DeadLetterSink`].

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::broker::domain::DeadLetterEntry;
use crate::broker::ports::{DeadLetterError, DeadLetterSink};

/// Dead-letter sink that keeps entries in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterSink {
    entries: Arc<RwLock<Vec<DeadLetterEntry>>>,
}

impl InMemoryDeadLetterSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every entry.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Removes and returns every entry.
    #[must_use]
    pub fn drain(&self) -> Vec<DeadLetterEntry> {
        self.entries
            .write()
            .map(|mut entries| std::mem::take(&mut *entries))
            .unwrap_or_default()
    }

    /// Returns the number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Returns `true` if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|err| DeadLetterError(err.to_string()))?;
        entries.push(entry);
        Ok(())
    }
}
