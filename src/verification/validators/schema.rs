//! Structural checks: addressing, content type and payload shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::domain::{ContentType, Message};
use crate::verification::domain::{JsonKind, RuleDescriptor, RuleViolation};
use crate::verification::json::lookup;
use crate::verification::ports::ValidationRule;

/// A field the payload must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRequirement {
    /// Dot path inside the payload.
    pub path: String,
    /// Required kind.
    #[serde(default = "any_kind")]
    pub kind: JsonKind,
}

const fn any_kind() -> JsonKind {
    JsonKind::Any
}

/// Parameters of [`SchemaValidator`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaParams {
    /// Accepted content types; empty accepts any.
    pub allowed_content_types: Vec<String>,
    /// Payload kind required per content type.
    pub payload_kinds: BTreeMap<String, JsonKind>,
    /// Fields required per content type.
    pub required_fields: BTreeMap<String, Vec<FieldRequirement>>,
}

impl Default for SchemaParams {
    fn default() -> Self {
        Self {
            allowed_content_types: vec![ContentType::TEXT.to_owned(), ContentType::JSON.to_owned()],
            payload_kinds: BTreeMap::from([
                (ContentType::TEXT.to_owned(), JsonKind::String),
                (ContentType::JSON.to_owned(), JsonKind::Any),
            ]),
            required_fields: BTreeMap::new(),
        }
    }
}

/// Rejects messages that are misaddressed or malformed for their content
/// type.
#[derive(Debug, Clone)]
pub struct SchemaValidator {
    descriptor: RuleDescriptor,
    params: SchemaParams,
}

impl SchemaValidator {
    /// Creates the validator.
    #[must_use]
    pub const fn new(descriptor: RuleDescriptor, params: SchemaParams) -> Self {
        Self { descriptor, params }
    }

    fn check_fields(&self, message: &Message) -> Result<(), RuleViolation> {
        let content_type = message.content_type().as_str();
        let Some(requirements) = self.params.required_fields.get(content_type) else {
            return Ok(());
        };
        for requirement in requirements {
            match lookup(message.payload(), &requirement.path) {
                None => {
                    return Err(RuleViolation::new(
                        &self.descriptor,
                        format!("missing required field {}", requirement.path),
                    ));
                }
                Some(value) if !requirement.kind.admits(value) => {
                    return Err(RuleViolation::new(
                        &self.descriptor,
                        format!("field {} must be {}", requirement.path, requirement.kind),
                    ));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl ValidationRule for SchemaValidator {
    fn descriptor(&self) -> &RuleDescriptor {
        &self.descriptor
    }

    fn check(&self, message: &Message) -> Result<(), RuleViolation> {
        if message.sender().is_blank() {
            return Err(RuleViolation::new(&self.descriptor, "sender is missing"));
        }
        if message.recipient().is_blank() {
            return Err(RuleViolation::new(&self.descriptor, "recipient is missing"));
        }

        let content_type = message.content_type().as_str();
        if !self.params.allowed_content_types.is_empty()
            && !self
                .params
                .allowed_content_types
                .iter()
                .any(|allowed| allowed == content_type)
        {
            return Err(RuleViolation::new(
                &self.descriptor,
                format!("content type {content_type} is not accepted"),
            ));
        }

        if let Some(kind) = self.params.payload_kinds.get(content_type)
            && !kind.admits(message.payload())
        {
            return Err(RuleViolation::new(
                &self.descriptor,
                format!("payload must be {kind} for {content_type}"),
            ));
        }

        self.check_fields(message)
    }
}
