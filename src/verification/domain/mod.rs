//! Domain types for message verification.

mod outcome;
mod rule;

pub use outcome::{Outcome, Rejection, VerificationResult};
pub use rule::{JsonKind, RuleDescriptor, RuleViolation};
