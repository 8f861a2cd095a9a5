//! Capability traits the pipeline is assembled from.

mod access;
mod rule;

#[cfg(test)]
pub use access::MockAccessTable;
pub use access::{AccessTable, WILDCARD};
pub use rule::{SanitizationRule, ValidationRule};
