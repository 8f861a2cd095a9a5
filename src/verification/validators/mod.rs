//! Built-in validation rules.
//!
//! Each validator pairs a [`RuleDescriptor`](crate::verification::domain::RuleDescriptor)
//! with a serde-friendly parameter struct so that rule sets can be loaded
//! from configuration.

mod content;
mod integrity;
mod permission;
mod schema;
mod size;

pub use content::{ContentParams, ContentValidator, DEFAULT_FORBIDDEN_PATTERNS, DEFAULT_MAX_URLS};
pub use integrity::IntegrityValidator;
pub use permission::{PermissionParams, PermissionValidator};
pub use schema::{FieldRequirement, SchemaParams, SchemaValidator};
pub use size::{
    DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_MAX_METADATA_BYTES, DEFAULT_MAX_PAYLOAD_BYTES, SizeParams,
    SizeValidator,
};
