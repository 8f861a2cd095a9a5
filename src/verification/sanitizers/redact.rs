//! Removal of credential-like keys from structured data.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::message::domain::Message;
use crate::verification::domain::RuleDescriptor;
use crate::verification::json::{metadata_map, metadata_value};
use crate::verification::ports::SanitizationRule;

/// Keys removed unless configuration says otherwise. Matching ignores
/// ASCII case.
pub const DEFAULT_REDACTED_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "access_key",
    "private_key",
    "authorization",
    "credentials",
];

/// Default maximum traversal depth.
pub const DEFAULT_REDACTION_DEPTH: usize = 10;

/// Parameters of [`KeyRedactionSanitizer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyRedactionParams {
    /// Object keys to strip.
    pub keys: Vec<String>,
    /// Containers nested deeper than this are emptied.
    pub max_depth: usize,
    /// Also redact the metadata map.
    pub include_metadata: bool,
}

impl Default for KeyRedactionParams {
    fn default() -> Self {
        Self {
            keys: DEFAULT_REDACTED_KEYS
                .iter()
                .map(|key| (*key).to_owned())
                .collect(),
            max_depth: DEFAULT_REDACTION_DEPTH,
            include_metadata: true,
        }
    }
}

/// Strips denylisted keys from payload objects and metadata.
#[derive(Debug, Clone)]
pub struct KeyRedactionSanitizer {
    descriptor: RuleDescriptor,
    params: KeyRedactionParams,
}

impl KeyRedactionSanitizer {
    /// Creates the sanitizer.
    #[must_use]
    pub const fn new(descriptor: RuleDescriptor, params: KeyRedactionParams) -> Self {
        Self { descriptor, params }
    }

    fn is_redacted(&self, key: &str) -> bool {
        self.params
            .keys
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(key))
    }

    fn redact(&self, value: &mut Value, depth: usize) -> bool {
        match value {
            Value::Object(map) if depth > self.params.max_depth => {
                let changed = !map.is_empty();
                map.clear();
                changed
            }
            Value::Array(items) if depth > self.params.max_depth => {
                let changed = !items.is_empty();
                items.clear();
                changed
            }
            Value::Object(map) => {
                let before = map.len();
                map.retain(|key, _| !self.is_redacted(key));
                let removed = map.len() != before;
                let nested = map.values_mut().fold(false, |changed, child| {
                    self.redact(child, depth.saturating_add(1)) || changed
                });
                removed || nested
            }
            Value::Array(items) => items.iter_mut().fold(false, |changed, child| {
                self.redact(child, depth.saturating_add(1)) || changed
            }),
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => false,
        }
    }
}

impl SanitizationRule for KeyRedactionSanitizer {
    fn descriptor(&self) -> &RuleDescriptor {
        &self.descriptor
    }

    fn transform(&self, message: &Message) -> Option<Message> {
        let mut payload = message.payload().clone();
        let payload_changed = self.redact(&mut payload, 0);

        let mut metadata = metadata_value(message.metadata());
        let metadata_changed = self.params.include_metadata && self.redact(&mut metadata, 0);

        if !payload_changed && !metadata_changed {
            return None;
        }
        debug!(message_id = %message.id(), "redacted credential-like keys");
        let with_payload = if payload_changed {
            message.with_payload(payload)
        } else {
            message.clone()
        };
        Some(if metadata_changed {
            with_payload.with_metadata(metadata_map(metadata))
        } else {
            with_payload
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn sanitizer(max_depth: usize) -> KeyRedactionSanitizer {
        KeyRedactionSanitizer::new(
            RuleDescriptor::new("key_redaction", 20),
            KeyRedactionParams {
                max_depth,
                ..KeyRedactionParams::default()
            },
        )
    }

    #[test]
    fn credential_keys_are_removed_at_any_level() {
        let message = Message::builder("planner", "coder")
            .with_json(json!({
                "user": "ana",
                "Password": "hunter2",
                "nested": [{"api_key": "k", "keep": true}]
            }))
            .with_metadata("token", json!("t"))
            .build(&ManualClock::default())
            .expect("valid message");

        let sanitized = sanitizer(DEFAULT_REDACTION_DEPTH)
            .transform(&message)
            .expect("changed");

        assert_eq!(
            sanitized.payload(),
            &json!({"user": "ana", "nested": [{"keep": true}]})
        );
        assert!(sanitized.metadata().get("token").is_none());
    }

    #[test]
    fn containers_beyond_the_depth_limit_are_emptied() {
        let message = Message::builder("planner", "coder")
            .with_json(json!({"a": {"b": {"c": 1}}}))
            .build(&ManualClock::default())
            .expect("valid message");

        let sanitized = sanitizer(1).transform(&message).expect("changed");

        assert_eq!(sanitized.payload(), &json!({"a": {"b": {}}}));
    }
}
