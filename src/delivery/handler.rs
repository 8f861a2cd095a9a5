//! Recipient-side contract of the delivery bus.

use async_trait::async_trait;
use thiserror::Error;

use crate::message::domain::Message;

/// Failure reported by a recipient; the detail becomes the nack reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Creates a handler error from any displayable detail.
    #[must_use]
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

/// An agent (or anything else) receiving messages from the bus.
///
/// Returning `Ok` acknowledges the delivery; a returned message is sent
/// through the bus as a reply. Returning `Err` rejects the delivery so the
/// broker redelivers it or dead-letters it.
#[async_trait]
pub trait RecipientHandler: Send + Sync {
    /// Processes one message.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] if the message could not be processed.
    async fn handle(&self, message: &Message) -> Result<Option<Message>, HandlerError>;
}
