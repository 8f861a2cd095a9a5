//! Size ceilings on the encoded message and its parts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::message::domain::Message;
use crate::verification::domain::{RuleDescriptor, RuleViolation};
use crate::verification::json::lookup;
use crate::verification::ports::ValidationRule;

/// Default ceiling on the whole encoded message.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Default ceiling on the encoded payload.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 512 * 1024;

/// Default ceiling on the encoded metadata.
pub const DEFAULT_MAX_METADATA_BYTES: usize = 16 * 1024;

/// Parameters of [`SizeValidator`]. Sizes are bytes of JSON encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizeParams {
    /// Ceiling on the whole message.
    pub max_message_bytes: usize,
    /// Ceiling on the payload.
    pub max_payload_bytes: usize,
    /// Ceiling on the metadata map.
    pub max_metadata_bytes: usize,
    /// Ceilings on individual payload fields, by dot path.
    pub field_limits: BTreeMap<String, usize>,
}

impl Default for SizeParams {
    fn default() -> Self {
        Self {
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_metadata_bytes: DEFAULT_MAX_METADATA_BYTES,
            field_limits: BTreeMap::new(),
        }
    }
}

/// Rejects messages whose encoding exceeds the configured ceilings.
#[derive(Debug, Clone)]
pub struct SizeValidator {
    descriptor: RuleDescriptor,
    params: SizeParams,
}

impl SizeValidator {
    /// Creates the validator.
    #[must_use]
    pub const fn new(descriptor: RuleDescriptor, params: SizeParams) -> Self {
        Self { descriptor, params }
    }

    fn encoded_len(&self, value: &impl Serialize) -> Result<usize, RuleViolation> {
        serde_json::to_vec(value)
            .map(|bytes| bytes.len())
            .map_err(|err| {
                RuleViolation::new(&self.descriptor, "message could not be measured")
                    .with_detail(err.to_string())
            })
    }

    fn ceiling(&self, what: &str, actual: usize, limit: usize) -> Result<(), RuleViolation> {
        if actual > limit {
            Err(RuleViolation::new(
                &self.descriptor,
                format!("{what} size ({actual} bytes) exceeds maximum ({limit} bytes)"),
            ))
        } else {
            Ok(())
        }
    }
}

impl ValidationRule for SizeValidator {
    fn descriptor(&self) -> &RuleDescriptor {
        &self.descriptor
    }

    fn check(&self, message: &Message) -> Result<(), RuleViolation> {
        let payload = self.encoded_len(message.payload())?;
        self.ceiling("Payload", payload, self.params.max_payload_bytes)?;

        if !message.metadata().is_empty() {
            let metadata = self.encoded_len(message.metadata())?;
            self.ceiling("Metadata", metadata, self.params.max_metadata_bytes)?;
        }

        let total = self.encoded_len(message)?;
        self.ceiling("Total message", total, self.params.max_message_bytes)?;

        for (path, limit) in &self.params.field_limits {
            if let Some(field) = lookup(message.payload(), path) {
                let size = self.encoded_len(field)?;
                self.ceiling(&format!("Field {path}"), size, *limit)?;
            }
        }
        Ok(())
    }
}
