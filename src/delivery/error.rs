//! Errors surfaced by the delivery bus.

use thiserror::Error;

use crate::broker::error::BrokerError;
use crate::message::domain::{AgentId, GroupId, MessageBuilderError};

/// Errors returned by [`super::DeliveryBus`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The group is not registered.
    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),

    /// The agent is not registered with this bus.
    #[error("unknown recipient: {0}")]
    UnknownRecipient(AgentId),

    /// The group has no member other than the sender.
    #[error("group {0} has no recipients")]
    EmptyGroup(GroupId),

    /// The bus has been closed.
    #[error("delivery bus is closed")]
    Closed,

    /// The message could not be sequenced.
    #[error(transparent)]
    Message(#[from] MessageBuilderError),

    /// The broker adapter refused the operation.
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
