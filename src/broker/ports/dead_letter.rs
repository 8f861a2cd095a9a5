//! Port for the dead-letter destination.

use async_trait::async_trait;
use thiserror::Error;

use crate::broker::domain::DeadLetterEntry;

/// Durable sink for messages that exhausted their attempts.
///
/// The core never reads entries back; operators do.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Records an entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError`] if the entry could not be stored.
    async fn record(&self, entry: DeadLetterEntry) -> Result<(), DeadLetterError>;
}

/// Failure to store a dead-letter entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dead-letter sink unavailable: {0}")]
pub struct DeadLetterError(pub String);
