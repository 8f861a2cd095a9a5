//! In-memory adapter implementations for testing and embedding.
//!
//! These adapters are thread-safe and need no external infrastructure.

mod broker;
mod dead_letter;

pub use broker::{CallCounts, InMemoryBroker};
pub use dead_letter::InMemoryDeadLetterSink;
