//! Built-in sanitization rules.
//!
//! Sanitizers never fail: each returns a rewritten copy of the message or
//! `None` when the message is already clean.

mod depth;
mod redact;
mod term_filter;
mod truncate;

pub use depth::{DEFAULT_MAX_DEPTH, DEPTH_PLACEHOLDER, DepthCapParams, DepthCapSanitizer};
pub use redact::{
    DEFAULT_REDACTED_KEYS, DEFAULT_REDACTION_DEPTH, KeyRedactionParams, KeyRedactionSanitizer,
};
pub use term_filter::{DEFAULT_REPLACEMENT, TermFilterParams, TermFilterSanitizer};
pub use truncate::{DEFAULT_MAX_TEXT_LENGTH, TruncationParams, TruncationSanitizer};
