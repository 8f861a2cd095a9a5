//! Ordering and idempotence for inbound deliveries.
//!
//! [`DedupCache`] suppresses redeliveries of a message id within a TTL
//! window. [`SequenceTracker`] hands out per-stream sequence numbers on the
//! sending side and releases inbound deliveries in order on the receiving
//! side. Both are owned components injected into the delivery bus.

mod dedup;
mod tracker;

pub use dedup::{DEFAULT_DEDUP_TTL, DEFAULT_PURGE_INTERVAL, DedupCache, Seen};
pub use tracker::{
    Admit, DEFAULT_HOLD_TIMEOUT, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_HELD, GapRelease,
    SequenceSettings, SequenceTracker, StreamKey, WorkflowSequenceState,
};
