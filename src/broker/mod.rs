//! Broker transport and its resilience layer.
//!
//! The module follows the hexagonal layout used across the crate:
//!
//! - Domain types in [`domain`]: deliveries, circuit state, dead letters,
//!   connection health
//! - Port contracts in [`ports`]: the raw transport and the dead-letter sink
//! - Adapter implementations in [`adapters`]
//! - The resilient adapter and its policies in [`services`]

pub mod adapters;
pub mod domain;
pub mod error;
pub mod ports;
pub mod services;

#[cfg(test)]
mod tests;
