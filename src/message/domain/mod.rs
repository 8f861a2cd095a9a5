//! Domain types for messages moved by the substrate.
//!
//! This module contains pure domain types with no infrastructure dependencies.
//! All types are immutable after construction and serialisable via serde.

mod ids;
mod message;
mod role;
mod signature;

pub use ids::{AgentId, GroupId, MessageId, SequenceNumber, WorkflowId};
pub use message::{ContentType, GROUP_MESSAGE_ID_KEY, Message, MessageBuilder, MessageBuilderError};
pub use role::{ParseRoleError, Role};
pub use signature::{SHA256_ALGORITHM, SignatureBlock, payload_digest};
