//! Nesting depth cap.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::domain::Message;
use crate::verification::domain::RuleDescriptor;
use crate::verification::ports::SanitizationRule;

/// Default maximum nesting depth.
pub const DEFAULT_MAX_DEPTH: usize = 5;

/// Marker left where a container was cut off.
pub const DEPTH_PLACEHOLDER: &str = "__max_depth_exceeded__";

/// Parameters of [`DepthCapSanitizer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthCapParams {
    /// Containers at this depth or deeper are replaced (the payload root
    /// is depth 0).
    pub max_depth: usize,
}

impl Default for DepthCapParams {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Replaces deeply nested containers with a placeholder.
#[derive(Debug, Clone)]
pub struct DepthCapSanitizer {
    descriptor: RuleDescriptor,
    max_depth: usize,
}

impl DepthCapSanitizer {
    /// Creates the sanitizer.
    #[must_use]
    pub const fn new(descriptor: RuleDescriptor, params: DepthCapParams) -> Self {
        Self {
            descriptor,
            max_depth: params.max_depth,
        }
    }

    fn cap(&self, value: &mut Value, depth: usize) -> bool {
        if depth >= self.max_depth {
            return match value {
                Value::Object(_) if *value != object_placeholder() => {
                    *value = object_placeholder();
                    true
                }
                Value::Array(_) if *value != array_placeholder() => {
                    *value = array_placeholder();
                    true
                }
                _ => false,
            };
        }
        let next = depth.saturating_add(1);
        match value {
            Value::Object(map) => map
                .values_mut()
                .fold(false, |changed, child| self.cap(child, next) || changed),
            Value::Array(items) => items
                .iter_mut()
                .fold(false, |changed, child| self.cap(child, next) || changed),
            Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => false,
        }
    }
}

fn object_placeholder() -> Value {
    let mut marker = Map::new();
    marker.insert(DEPTH_PLACEHOLDER.to_owned(), Value::Bool(true));
    Value::Object(marker)
}

fn array_placeholder() -> Value {
    Value::Array(vec![Value::String(DEPTH_PLACEHOLDER.to_owned())])
}

impl SanitizationRule for DepthCapSanitizer {
    fn descriptor(&self) -> &RuleDescriptor {
        &self.descriptor
    }

    fn transform(&self, message: &Message) -> Option<Message> {
        let mut payload = message.payload().clone();
        self.cap(&mut payload, 0)
            .then(|| message.with_payload(payload))
    }
}
