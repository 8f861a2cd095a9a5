//! Canonical message format shared by every subsystem.
//!
//! The broker adapter transports [`domain::Message`] values, the delivery
//! bus sequences and deduplicates them, and the verification gate checks
//! and sanitises them.
//!
//! # Example
//!
//! ```
//! use mockable::DefaultClock;
//! use serde_json::json;
//! use switchyard::message::domain::{Message, SequenceNumber};
//!
//! let message = Message::builder("planner", "coder")
//!     .with_json(json!({"task": "write tests"}))
//!     .with_workflow("w1")
//!     .build(&DefaultClock)
//!     .expect("valid message");
//!
//! let sequenced = message
//!     .with_sequence(SequenceNumber::new(1))
//!     .expect("first assignment");
//! assert_eq!(sequenced.sequence(), Some(SequenceNumber::new(1)));
//! ```

pub mod domain;
