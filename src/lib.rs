//! Switchyard: a resilient message substrate for autonomous agents.
//!
//! Agents exchange [`message::domain::Message`] values through a
//! [`delivery::DeliveryBus`] that sits on a resilient broker adapter and
//! guarantees per-workflow ordering and idempotent processing. A
//! [`verification::VerificationGate`] vets messages before they are sent,
//! and a [`rate_limit::AdaptiveRateLimiter`] paces calls to shared
//! resources according to their observed health.
//!
//! # Architecture
//!
//! Each bounded context follows a hexagonal layout:
//!
//! - **Domain**: plain data and state machines with no I/O
//! - **Ports**: traits for external collaborators (the broker transport,
//!   dead-letter storage, access tables)
//! - **Adapters**: in-memory implementations of the ports
//! - **Services**: the components callers hold
//!
//! # Modules
//!
//! - [`message`]: the canonical message format
//! - [`broker`]: the broker port, its resilient adapter and circuit breaker
//! - [`sequencing`]: duplicate suppression and per-stream ordering
//! - [`delivery`]: recipient registration, groups and ordered delivery
//! - [`verification`]: validators, sanitizers and the gate
//! - [`rate_limit`]: health-aware token buckets
//! - [`events`]: structured events emitted by every component
//! - [`config`], [`runtime`], [`telemetry`], [`clock`]: assembly and
//!   ambient concerns

pub mod broker;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod events;
pub mod message;
pub mod rate_limit;
pub mod runtime;
pub mod sequencing;
pub mod telemetry;
pub mod verification;
