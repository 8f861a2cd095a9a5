//! Transport adapters for the broker port.
//!
//! - [`memory::InMemoryBroker`]: queue-semantics broker with fault injection
//! - [`memory::InMemoryDeadLetterSink`]: dead-letter sink kept in memory

pub mod memory;
