//! Length limits for text payloads and individual fields.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::message::domain::Message;
use crate::verification::domain::RuleDescriptor;
use crate::verification::json::{lookup_mut, metadata_map, metadata_value, truncate_chars};
use crate::verification::ports::SanitizationRule;

/// Default character limit of a plain string payload.
pub const DEFAULT_MAX_TEXT_LENGTH: usize = 10_000;

const PAYLOAD_ROOT: &str = "payload.";
const METADATA_ROOT: &str = "metadata.";

/// Parameters of [`TruncationSanitizer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncationParams {
    /// Character limit of a payload that is a single string.
    pub max_text_length: usize,
    /// Character limits by path, rooted at `payload.` or `metadata.`.
    pub field_limits: BTreeMap<String, usize>,
}

impl Default for TruncationParams {
    fn default() -> Self {
        Self {
            max_text_length: DEFAULT_MAX_TEXT_LENGTH,
            field_limits: BTreeMap::from([
                ("payload.text".to_owned(), 5_000),
                ("payload.subject".to_owned(), 200),
                ("metadata.description".to_owned(), 1_000),
            ]),
        }
    }
}

/// Cuts overlong strings and marks the cut with `...`.
#[derive(Debug, Clone)]
pub struct TruncationSanitizer {
    descriptor: RuleDescriptor,
    params: TruncationParams,
}

impl TruncationSanitizer {
    /// Creates the sanitizer.
    #[must_use]
    pub const fn new(descriptor: RuleDescriptor, params: TruncationParams) -> Self {
        Self { descriptor, params }
    }

    fn truncate_fields(&self, root: &str, value: &mut Value) -> bool {
        let mut changed = false;
        for (path, limit) in &self.params.field_limits {
            let Some(relative) = path.strip_prefix(root) else {
                continue;
            };
            if let Some(Value::String(text)) = lookup_mut(value, relative)
                && let Some(truncated) = truncate_chars(text, *limit)
            {
                *text = truncated;
                changed = true;
            }
        }
        changed
    }
}

impl SanitizationRule for TruncationSanitizer {
    fn descriptor(&self) -> &RuleDescriptor {
        &self.descriptor
    }

    fn transform(&self, message: &Message) -> Option<Message> {
        let mut payload = message.payload().clone();
        let mut payload_changed = false;
        if let Value::String(text) = &mut payload
            && let Some(truncated) = truncate_chars(text, self.params.max_text_length)
        {
            *text = truncated;
            payload_changed = true;
        }
        payload_changed |= self.truncate_fields(PAYLOAD_ROOT, &mut payload);

        let mut metadata = metadata_value(message.metadata());
        let metadata_changed = self.truncate_fields(METADATA_ROOT, &mut metadata);

        if !payload_changed && !metadata_changed {
            return None;
        }
        debug!(message_id = %message.id(), "truncated overlong fields");
        let mut sanitized = message.clone();
        if payload_changed {
            sanitized = sanitized.with_payload(payload);
        }
        if metadata_changed {
            sanitized = sanitized.with_metadata(metadata_map(metadata));
        }
        Some(sanitized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    #[test]
    fn long_text_payload_is_cut() {
        let sanitizer = TruncationSanitizer::new(
            RuleDescriptor::new("truncation", 40),
            TruncationParams {
                max_text_length: 5,
                field_limits: BTreeMap::new(),
            },
        );
        let message = Message::builder("planner", "coder")
            .with_text("abcdefgh")
            .build(&ManualClock::default())
            .expect("valid message");

        let sanitized = sanitizer.transform(&message).expect("changed");

        assert_eq!(sanitized.payload(), &json!("abcde..."));
        assert_eq!(sanitized.id(), message.id());
    }

    #[test]
    fn field_limits_cover_payload_and_metadata() {
        let sanitizer = TruncationSanitizer::new(
            RuleDescriptor::new("truncation", 40),
            TruncationParams {
                max_text_length: 100,
                field_limits: BTreeMap::from([
                    ("payload.task.title".to_owned(), 3),
                    ("metadata.description".to_owned(), 4),
                ]),
            },
        );
        let message = Message::builder("planner", "coder")
            .with_json(json!({"task": {"title": "refactor"}}))
            .with_metadata("description", json!("long description"))
            .build(&ManualClock::default())
            .expect("valid message");

        let sanitized = sanitizer.transform(&message).expect("changed");

        assert_eq!(sanitized.payload(), &json!({"task": {"title": "ref..."}}));
        assert_eq!(
            sanitized.metadata().get("description"),
            Some(&json!("long..."))
        );
    }

    #[test]
    fn short_messages_are_untouched() {
        let sanitizer =
            TruncationSanitizer::new(RuleDescriptor::new("truncation", 40), TruncationParams::default());
        let message = Message::builder("planner", "coder")
            .with_json(json!({"text": "short"}))
            .build(&ManualClock::default())
            .expect("valid message");

        assert_eq!(sanitizer.transform(&message), None);
    }
}
