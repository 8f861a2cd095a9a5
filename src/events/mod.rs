//! Structured events emitted at every significant transition.
//!
//! Components never talk to a logging or metrics backend directly. They emit
//! [`CoreEvent`] values through an [`EventSink`]; the host decides where the
//! events go. [`TracingEventSink`] turns them into `tracing` events and
//! [`RecordingEventSink`] keeps them in memory for assertions.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broker::domain::{CircuitPhase, DeliveryId, Topic};
use crate::message::domain::{AgentId, MessageId, SequenceNumber, WorkflowId};
use crate::rate_limit::HealthState;

/// A structured event. Every variant carries a message or resource
/// identifier for correlation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    /// A message was handed to a recipient.
    DeliveryAttempted {
        /// Message being delivered.
        message_id: MessageId,
        /// Broker delivery.
        delivery_id: DeliveryId,
        /// 1-based attempt counter.
        attempt: u32,
    },
    /// A delivery was acknowledged.
    Acknowledged {
        /// Acknowledged message.
        message_id: MessageId,
        /// Broker delivery.
        delivery_id: DeliveryId,
    },
    /// A delivery was negatively acknowledged.
    Nacked {
        /// Rejected message.
        message_id: MessageId,
        /// Broker delivery.
        delivery_id: DeliveryId,
        /// Attempt that failed.
        attempt: u32,
        /// Failure detail.
        reason: String,
        /// Whether the delivery goes back on the queue.
        requeued: bool,
    },
    /// A message was routed to the dead-letter destination.
    DeadLettered {
        /// Dead-lettered message.
        message_id: MessageId,
        /// Dead-letter destination.
        destination: Topic,
        /// Last failure.
        reason: String,
        /// Attempts made.
        attempts: u32,
    },
    /// A duplicate message was acknowledged and dropped.
    DuplicateDropped {
        /// Duplicate message id.
        message_id: MessageId,
    },
    /// A message arrived behind its stream's position and was dropped.
    StaleDropped {
        /// Dropped message.
        message_id: MessageId,
        /// Its sequence number.
        sequence: SequenceNumber,
    },
    /// A timed-out gap was skipped to keep the stream moving.
    SequenceGapSkipped {
        /// Workflow of the stream.
        workflow_id: WorkflowId,
        /// Recipient of the stream.
        recipient: AgentId,
        /// Sequence numbers given up on.
        missing: Vec<SequenceNumber>,
    },
    /// The circuit breaker changed phase.
    CircuitTransitioned {
        /// Connection guarded by the breaker.
        resource: String,
        /// Previous phase.
        from: CircuitPhase,
        /// New phase.
        to: CircuitPhase,
    },
    /// A message failed verification.
    VerificationRejected {
        /// Rejected message.
        message_id: MessageId,
        /// Failing rule.
        rule: String,
        /// Public reason.
        reason: String,
    },
    /// Sanitizers rewrote a message.
    VerificationSanitized {
        /// Sanitized message (id is preserved).
        message_id: MessageId,
        /// Sanitizers that changed the message.
        rules: Vec<String>,
    },
    /// The rate limiter denied a request.
    RateLimitDenied {
        /// Throttled resource.
        resource: String,
        /// Tokens requested.
        requested: u64,
    },
    /// A resource changed health state.
    HealthTransitioned {
        /// Resource whose health changed.
        resource: String,
        /// Previous state.
        from: HealthState,
        /// New state.
        to: HealthState,
        /// Throughput factor now in force, in percent.
        throughput_percent: u8,
    },
    /// The broker connection was re-established.
    Reconnected {
        /// Connection name.
        resource: String,
        /// Connection attempts used.
        attempts: u32,
    },
    /// Reconnection gave up.
    ReconnectFailed {
        /// Connection name.
        resource: String,
        /// Connection attempts made.
        attempts: u32,
    },
}

/// Receives structured events.
pub trait EventSink: Send + Sync {
    /// Consumes one event. Must not block.
    fn emit(&self, event: CoreEvent);
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: CoreEvent) {
        match event {
            CoreEvent::DeliveryAttempted {
                message_id,
                delivery_id,
                attempt,
            } => debug!(%message_id, %delivery_id, attempt, "delivering message"),
            CoreEvent::Acknowledged {
                message_id,
                delivery_id,
            } => debug!(%message_id, %delivery_id, "delivery acknowledged"),
            CoreEvent::Nacked {
                message_id,
                delivery_id,
                attempt,
                reason,
                requeued,
            } => warn!(%message_id, %delivery_id, attempt, requeued, %reason, "delivery rejected"),
            CoreEvent::DeadLettered {
                message_id,
                destination,
                reason,
                attempts,
            } => error!(%message_id, %destination, attempts, %reason, "message dead-lettered"),
            CoreEvent::DuplicateDropped { message_id } => {
                debug!(%message_id, "duplicate message dropped");
            }
            CoreEvent::StaleDropped {
                message_id,
                sequence,
            } => info!(%message_id, %sequence, "stale message dropped"),
            CoreEvent::SequenceGapSkipped {
                workflow_id,
                recipient,
                missing,
            } => warn!(%workflow_id, %recipient, ?missing, "sequence gap timed out; advancing"),
            CoreEvent::CircuitTransitioned { resource, from, to } => {
                warn!(%resource, %from, %to, "circuit breaker transition");
            }
            CoreEvent::VerificationRejected {
                message_id,
                rule,
                reason,
            } => info!(%message_id, %rule, %reason, "message rejected by verification"),
            CoreEvent::VerificationSanitized { message_id, rules } => {
                debug!(%message_id, ?rules, "message sanitized");
            }
            CoreEvent::RateLimitDenied {
                resource,
                requested,
            } => debug!(%resource, requested, "rate limit denied"),
            CoreEvent::HealthTransitioned {
                resource,
                from,
                to,
                throughput_percent,
            } => warn!(%resource, %from, %to, throughput_percent, "resource health transition"),
            CoreEvent::Reconnected { resource, attempts } => {
                info!(%resource, attempts, "broker reconnected");
            }
            CoreEvent::ReconnectFailed { resource, attempts } => {
                error!(%resource, attempts, "broker reconnection failed");
            }
        }
    }
}

/// Keeps events in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<CoreEvent>>>,
}

impl RecordingEventSink {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every recorded event.
    #[must_use]
    pub fn events(&self) -> Vec<CoreEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Counts recorded events matching a predicate.
    #[must_use]
    pub fn count(&self, predicate: impl Fn(&CoreEvent) -> bool) -> usize {
        self.events
            .lock()
            .map(|events| events.iter().filter(|event| predicate(event)).count())
            .unwrap_or(0)
    }

    /// Removes and returns every recorded event.
    #[must_use]
    pub fn drain(&self) -> Vec<CoreEvent> {
        self.events
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: CoreEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Fans events out to several sinks.
#[derive(Clone, Default)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    /// Creates a sink forwarding to each of `sinks` in order.
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: CoreEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
