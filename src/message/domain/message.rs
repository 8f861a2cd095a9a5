//! The `Message` value moved between agents.
//!
//! Messages are immutable once built. Operations that need a different
//! message (sequencing, sanitisation, group fan-out) return a new value.

use super::{AgentId, MessageId, Role, SequenceNumber, SignatureBlock, WorkflowId};
use chrono::{DateTime, Utc};
use mockable::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Metadata key recording the identifier of the group message a fan-out copy
/// was derived from.
pub const GROUP_MESSAGE_ID_KEY: &str = "group_message_id";

/// Content-type tag describing how the payload should be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentType(String);

impl ContentType {
    /// Plain text payload carried as a JSON string.
    pub const TEXT: &'static str = "text/plain";
    /// Structured JSON payload.
    pub const JSON: &'static str = "application/json";

    /// Creates a content type tag.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The `text/plain` tag.
    #[must_use]
    pub fn text() -> Self {
        Self::new(Self::TEXT)
    }

    /// The `application/json` tag.
    #[must_use]
    pub fn json() -> Self {
        Self::new(Self::JSON)
    }

    /// Returns the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ContentType {
    fn default() -> Self {
        Self::json()
    }
}

impl From<&str> for ContentType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message addressed from one agent to another.
///
/// # Invariants
///
/// - `id` is populated (a fresh id is generated when none is supplied)
/// - once `sequence` is set it never changes
/// - messages cannot be modified in place
///
/// # Examples
///
/// ```
/// use mockable::DefaultClock;
/// use switchyard::message::domain::{Message, Role};
///
/// let message = Message::builder("planner", "coder")
///     .with_text("Implement the parser")
///     .with_role(Role::Assistant)
///     .with_workflow("w1")
///     .build(&DefaultClock)
///     .expect("valid message");
///
/// assert_eq!(message.recipient().as_str(), "coder");
/// assert!(message.sequence().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: MessageId,
    sender: AgentId,
    recipient: AgentId,
    payload: Value,
    content_type: ContentType,
    role: Role,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
    #[serde(default)]
    workflow_id: Option<WorkflowId>,
    #[serde(default)]
    sequence: Option<SequenceNumber>,
    #[serde(default)]
    signature: Option<SignatureBlock>,
    created_at: DateTime<Utc>,
}

impl Message {
    /// Returns a builder for a message from `sender` to `recipient`.
    #[must_use]
    pub fn builder(sender: impl Into<AgentId>, recipient: impl Into<AgentId>) -> MessageBuilder {
        MessageBuilder::new(sender.into(), recipient.into())
    }

    /// Returns the message identifier.
    #[must_use]
    pub const fn id(&self) -> &MessageId {
        &self.id
    }

    /// Returns the sender.
    #[must_use]
    pub const fn sender(&self) -> &AgentId {
        &self.sender
    }

    /// Returns the recipient (an agent or a group member).
    #[must_use]
    pub const fn recipient(&self) -> &AgentId {
        &self.recipient
    }

    /// Returns the payload.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns the content-type tag.
    #[must_use]
    pub const fn content_type(&self) -> &ContentType {
        &self.content_type
    }

    /// Returns the role tag.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Returns the free-form metadata map.
    #[must_use]
    pub const fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    /// Returns the workflow this message belongs to, if any.
    #[must_use]
    pub const fn workflow_id(&self) -> Option<&WorkflowId> {
        self.workflow_id.as_ref()
    }

    /// Returns the assigned sequence number, if any.
    #[must_use]
    pub const fn sequence(&self) -> Option<SequenceNumber> {
        self.sequence
    }

    /// Returns the signature block, if any.
    #[must_use]
    pub const fn signature(&self) -> Option<&SignatureBlock> {
        self.signature.as_ref()
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns a copy of this message carrying `sequence`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBuilderError::SequenceAlreadyAssigned`] if the message
    /// already carries a different sequence number.
    pub fn with_sequence(&self, sequence: SequenceNumber) -> Result<Self, MessageBuilderError> {
        match self.sequence {
            Some(existing) if existing != sequence => {
                Err(MessageBuilderError::SequenceAlreadyAssigned {
                    existing,
                    requested: sequence,
                })
            }
            _ => Ok(Self {
                sequence: Some(sequence),
                ..self.clone()
            }),
        }
    }

    /// Returns a copy of this message with a replaced payload.
    ///
    /// The signature block covered the old payload and is dropped.
    #[must_use]
    pub fn with_payload(&self, payload: Value) -> Self {
        Self {
            payload,
            signature: None,
            ..self.clone()
        }
    }

    /// Returns a copy of this message with a replaced metadata map.
    #[must_use]
    pub fn with_metadata(&self, metadata: BTreeMap<String, Value>) -> Self {
        Self {
            metadata,
            ..self.clone()
        }
    }

    /// Returns a copy addressed to a single group member.
    ///
    /// The copy gets a fresh identifier so that deduplication treats each
    /// member's delivery independently; the original identifier is kept in
    /// the metadata under [`GROUP_MESSAGE_ID_KEY`].
    #[must_use]
    pub fn for_member(&self, member: AgentId) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.insert(
            GROUP_MESSAGE_ID_KEY.to_owned(),
            Value::String(self.id.as_str().to_owned()),
        );
        Self {
            id: MessageId::new(),
            recipient: member,
            metadata,
            ..self.clone()
        }
    }
}

/// Builder for [`Message`].
#[derive(Debug)]
pub struct MessageBuilder {
    id: Option<MessageId>,
    sender: AgentId,
    recipient: AgentId,
    payload: Value,
    content_type: ContentType,
    role: Role,
    metadata: BTreeMap<String, Value>,
    workflow_id: Option<WorkflowId>,
    sequence: Option<SequenceNumber>,
    signature: Option<SignatureBlock>,
}

impl MessageBuilder {
    /// Creates a builder with an empty JSON object payload.
    #[must_use]
    pub fn new(sender: AgentId, recipient: AgentId) -> Self {
        Self {
            id: None,
            sender,
            recipient,
            payload: Value::Object(serde_json::Map::new()),
            content_type: ContentType::json(),
            role: Role::default(),
            metadata: BTreeMap::new(),
            workflow_id: None,
            sequence: None,
            signature: None,
        }
    }

    /// Sets a specific message id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<MessageId>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets a JSON payload and the `application/json` content type.
    #[must_use]
    pub fn with_json(mut self, payload: Value) -> Self {
        self.payload = payload;
        self.content_type = ContentType::json();
        self
    }

    /// Sets a text payload and the `text/plain` content type.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.payload = Value::String(text.into());
        self.content_type = ContentType::text();
        self
    }

    /// Overrides the content-type tag.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<ContentType>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Sets the role tag.
    #[must_use]
    pub const fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Places the message in a workflow.
    #[must_use]
    pub fn with_workflow(mut self, workflow_id: impl Into<WorkflowId>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    /// Pre-assigns a sequence number.
    #[must_use]
    pub const fn with_sequence(mut self, sequence: SequenceNumber) -> Self {
        self.sequence = Some(sequence);
        self
    }

    /// Attaches a signature block.
    #[must_use]
    pub fn with_signature(mut self, signature: SignatureBlock) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Builds the message, generating an id when none was supplied.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBuilderError::BlankSender`] or
    /// [`MessageBuilderError::BlankRecipient`] for whitespace-only parties.
    pub fn build(self, clock: &impl Clock) -> Result<Message, MessageBuilderError> {
        if self.sender.is_blank() {
            return Err(MessageBuilderError::BlankSender);
        }
        if self.recipient.is_blank() {
            return Err(MessageBuilderError::BlankRecipient);
        }

        Ok(Message {
            id: self.id.unwrap_or_default(),
            sender: self.sender,
            recipient: self.recipient,
            payload: self.payload,
            content_type: self.content_type,
            role: self.role,
            metadata: self.metadata,
            workflow_id: self.workflow_id,
            sequence: self.sequence,
            signature: self.signature,
            created_at: clock.utc(),
        })
    }
}

/// Errors that can occur when building or deriving a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageBuilderError {
    /// The sender id is empty.
    #[error("message sender must not be blank")]
    BlankSender,
    /// The recipient id is empty.
    #[error("message recipient must not be blank")]
    BlankRecipient,
    /// A different sequence number was already assigned.
    #[error("message already carries sequence {existing}; refusing to assign {requested}")]
    SequenceAlreadyAssigned {
        /// The sequence number already on the message.
        existing: SequenceNumber,
        /// The sequence number that was requested.
        requested: SequenceNumber,
    },
}
