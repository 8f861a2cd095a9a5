//! Message verification: validators, sanitizers and the gate in front of
//! the delivery bus.
//!
//! - Domain types in [`domain`]: rule identity, violations and outcomes
//! - Capability traits in [`ports`]: validation, sanitization and the
//!   external access table
//! - Built-in rules in [`validators`] and [`sanitizers`]
//! - [`adapters`]: a static access table
//! - [`services`]: rule set construction, [`VerificationPipeline`] and
//!   [`VerificationGate`]

pub mod adapters;
pub mod domain;
pub mod error;
mod json;
pub mod ports;
pub mod sanitizers;
pub mod services;
pub mod validators;

pub use error::{GateError, RuleConfigError};
pub use services::{
    RuleRegistry, RuleSet, VerificationGate, VerificationPipeline, VerificationSettings,
};

#[cfg(test)]
mod tests;
