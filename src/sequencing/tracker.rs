//! Per-stream sequencing with a bounded holding buffer.
//!
//! A stream is one workflow as seen by one recipient. Senders draw
//! 1-based numbers from [`SequenceTracker::assign`], one per message id;
//! receivers pass each
//! delivery through [`SequenceTracker::admit`], which releases messages
//! strictly in order and holds early arrivals until the gap fills or the
//! hold deadline passes. A gap that outlives its deadline is skipped and
//! recorded as missing; anything that later arrives behind it is stale.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockable::Clock;
use tracing::{debug, warn};

use crate::broker::domain::Delivery;
use crate::clock::{elapsed_between, to_time_delta};
use crate::message::domain::{AgentId, Message, MessageId, SequenceNumber, WorkflowId};

/// Default time an early message waits for the gap before it.
pub const DEFAULT_HOLD_TIMEOUT: Duration = Duration::from_secs(30);

/// Default inactivity after which stream state is collected.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Default maximum number of held messages per stream.
pub const DEFAULT_MAX_HELD: usize = 100;

/// Identity of an ordered stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey {
    /// Workflow the messages belong to.
    pub workflow: WorkflowId,
    /// Agent receiving the stream.
    pub recipient: AgentId,
}

impl StreamKey {
    /// Creates a stream key.
    #[must_use]
    pub const fn new(workflow: WorkflowId, recipient: AgentId) -> Self {
        Self {
            workflow,
            recipient,
        }
    }

    /// Returns the stream a message belongs to, if it is part of a workflow.
    #[must_use]
    pub fn for_message(message: &Message) -> Option<Self> {
        message
            .workflow_id()
            .map(|workflow| Self::new(workflow.clone(), message.recipient().clone()))
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workflow, self.recipient)
    }
}

/// Tunables of a [`SequenceTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceSettings {
    /// How long an early message waits before its gap is skipped.
    pub hold_timeout: Duration,
    /// Inactivity after which stream state is collected.
    pub idle_timeout: Duration,
    /// Held messages per stream before new early arrivals are refused.
    pub max_held: usize,
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            hold_timeout: DEFAULT_HOLD_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_held: DEFAULT_MAX_HELD,
        }
    }
}

/// Decision for an inbound delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum Admit {
    /// Dispatch these deliveries now, in this order.
    Deliver(Vec<Delivery>),
    /// The delivery is early and waits in the holding buffer.
    Held,
    /// The sequence number was already processed or skipped; the
    /// delivery is handed back.
    Stale(Delivery),
    /// The holding buffer is full; the delivery is handed back.
    Overflow(Delivery),
}

/// Deliveries released by skipping a timed-out gap.
#[derive(Debug, Clone, PartialEq)]
pub struct GapRelease {
    /// Stream the gap belonged to.
    pub key: StreamKey,
    /// Deliveries now contiguous, in order.
    pub released: Vec<Delivery>,
    /// Sequence numbers declared missing.
    pub skipped: Vec<SequenceNumber>,
}

#[derive(Debug, Clone, PartialEq)]
struct HeldEntry {
    delivery: Delivery,
    deadline: DateTime<Utc>,
}

/// Receiver-side state of one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSequenceState {
    key: StreamKey,
    next_expected: SequenceNumber,
    processed: BTreeSet<SequenceNumber>,
    held: BTreeMap<SequenceNumber, HeldEntry>,
    missing: BTreeSet<SequenceNumber>,
    last_activity: DateTime<Utc>,
}

impl WorkflowSequenceState {
    fn new(key: StreamKey, now: DateTime<Utc>) -> Self {
        Self {
            key,
            next_expected: SequenceNumber::FIRST,
            processed: BTreeSet::new(),
            held: BTreeMap::new(),
            missing: BTreeSet::new(),
            last_activity: now,
        }
    }

    /// Returns the stream key.
    #[must_use]
    pub const fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Returns the next sequence number the stream will release.
    #[must_use]
    pub const fn next_expected(&self) -> SequenceNumber {
        self.next_expected
    }

    /// Returns `true` if `sequence` was released to the recipient.
    #[must_use]
    pub fn is_processed(&self, sequence: SequenceNumber) -> bool {
        self.processed.contains(&sequence)
    }

    /// Returns the held sequence numbers in order.
    #[must_use]
    pub fn held(&self) -> Vec<SequenceNumber> {
        self.held.keys().copied().collect()
    }

    /// Returns every sequence number skipped so far.
    #[must_use]
    pub fn missing(&self) -> Vec<SequenceNumber> {
        self.missing.iter().copied().collect()
    }

    /// Returns the time of the last admission or release.
    #[must_use]
    pub const fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    fn drain_contiguous(&mut self, first: Option<Delivery>) -> Vec<Delivery> {
        let mut batch = Vec::new();
        if let Some(delivery) = first {
            self.processed.insert(self.next_expected);
            self.next_expected = self.next_expected.next();
            batch.push(delivery);
        }
        while let Some(entry) = self.held.remove(&self.next_expected) {
            self.processed.insert(self.next_expected);
            self.next_expected = self.next_expected.next();
            batch.push(entry.delivery);
        }
        batch
    }

    fn has_due(&self, now: DateTime<Utc>) -> bool {
        self.held.values().any(|entry| entry.deadline <= now)
    }

    fn skip_gap(&mut self) -> Vec<SequenceNumber> {
        let Some(&first_held) = self.held.keys().next() else {
            return Vec::new();
        };
        let mut skipped = Vec::new();
        let mut cursor = self.next_expected;
        while cursor < first_held {
            skipped.push(cursor);
            self.missing.insert(cursor);
            cursor = cursor.next();
        }
        self.next_expected = first_held;
        skipped
    }
}

#[derive(Debug, Clone)]
struct OutboundCounter {
    next: SequenceNumber,
    assigned: HashMap<MessageId, SequenceNumber>,
    last_activity: DateTime<Utc>,
}

#[derive(Default)]
struct Streams {
    inbound: HashMap<StreamKey, WorkflowSequenceState>,
    outbound: HashMap<StreamKey, OutboundCounter>,
}

/// Assigns and enforces per-stream ordering.
pub struct SequenceTracker<C: Clock + Send + Sync> {
    streams: Mutex<Streams>,
    settings: RwLock<SequenceSettings>,
    clock: Arc<C>,
}

impl<C: Clock + Send + Sync> SequenceTracker<C> {
    /// Creates a tracker.
    #[must_use]
    pub fn new(settings: SequenceSettings, clock: Arc<C>) -> Self {
        Self {
            streams: Mutex::new(Streams::default()),
            settings: RwLock::new(settings),
            clock,
        }
    }

    /// Returns the current settings.
    #[must_use]
    pub fn settings(&self) -> SequenceSettings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Changes how long early messages are held. Applies to new holds.
    pub fn set_hold_timeout(&self, timeout: Duration) {
        self.settings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .hold_timeout = timeout;
    }

    /// Changes the inactivity limit used by [`Self::collect_idle`].
    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.settings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .idle_timeout = timeout;
    }

    /// Replaces every setting at once. Messages already held keep their
    /// deadlines.
    pub fn reconfigure(&self, settings: SequenceSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Returns the outbound sequence number of message `id` on `key`.
    ///
    /// A message id keeps the number it was first given for as long as the
    /// stream lives, so a resent message never opens a gap behind it.
    #[must_use]
    pub fn assign(&self, key: &StreamKey, id: &MessageId) -> SequenceNumber {
        let now = self.clock.utc();
        let mut streams = self.lock();
        let counter = streams
            .outbound
            .entry(key.clone())
            .or_insert_with(|| OutboundCounter {
                next: SequenceNumber::FIRST,
                assigned: HashMap::new(),
                last_activity: now,
            });
        counter.last_activity = now;
        if let Some(&existing) = counter.assigned.get(id) {
            debug!(stream = %key, message_id = %id, sequence = %existing, "reusing sequence number");
            return existing;
        }
        let assigned = counter.next;
        counter.next = assigned.next();
        counter.assigned.insert(id.clone(), assigned);
        assigned
    }

    /// Decides what to do with an inbound delivery.
    ///
    /// Deliveries outside a workflow or without a sequence number are
    /// released immediately.
    #[must_use]
    pub fn admit(&self, delivery: Delivery) -> Admit {
        let (Some(key), Some(sequence)) = (
            StreamKey::for_message(&delivery.message),
            delivery.message.sequence(),
        ) else {
            return Admit::Deliver(vec![delivery]);
        };

        let now = self.clock.utc();
        let settings = self.settings();
        let mut streams = self.lock();
        let state = streams
            .inbound
            .entry(key.clone())
            .or_insert_with(|| WorkflowSequenceState::new(key.clone(), now));
        state.last_activity = now;

        if sequence < state.next_expected || state.held.contains_key(&sequence) {
            debug!(stream = %key, %sequence, next = %state.next_expected, "stale sequence");
            return Admit::Stale(delivery);
        }
        if sequence == state.next_expected {
            return Admit::Deliver(state.drain_contiguous(Some(delivery)));
        }
        if state.held.len() >= settings.max_held {
            warn!(stream = %key, %sequence, held = state.held.len(), "holding buffer full");
            return Admit::Overflow(delivery);
        }
        let deadline = now
            .checked_add_signed(to_time_delta(settings.hold_timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        debug!(stream = %key, %sequence, next = %state.next_expected, "holding early sequence");
        state.held.insert(sequence, HeldEntry { delivery, deadline });
        Admit::Held
    }

    /// Puts deliveries back after a failed dispatch.
    ///
    /// `failed` becomes the next expected number again, so its redelivery
    /// is admitted; `undelivered` are the later members of the same batch,
    /// which return to the holding buffer with a fresh deadline.
    pub fn rewind(&self, key: &StreamKey, failed: SequenceNumber, undelivered: Vec<Delivery>) {
        let now = self.clock.utc();
        let deadline = now
            .checked_add_signed(to_time_delta(self.settings().hold_timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut streams = self.lock();
        let Some(state) = streams.inbound.get_mut(key) else {
            return;
        };
        if failed >= state.next_expected {
            return;
        }
        state.processed.remove(&failed);
        for delivery in undelivered {
            if let Some(sequence) = delivery.message.sequence()
                && sequence > failed
            {
                state.processed.remove(&sequence);
                state.held.insert(sequence, HeldEntry { delivery, deadline });
            }
        }
        state.next_expected = failed;
        state.last_activity = now;
        debug!(stream = %key, sequence = %failed, held = state.held.len(), "sequence rewound");
    }

    /// Gives up on `sequence` after its delivery was dead-lettered.
    ///
    /// If the stream is waiting for exactly that number it is recorded as
    /// missing and the held messages behind it are released.
    #[must_use]
    pub fn abandon(&self, key: &StreamKey, sequence: SequenceNumber) -> Vec<Delivery> {
        let mut streams = self.lock();
        let Some(state) = streams.inbound.get_mut(key) else {
            return Vec::new();
        };
        if state.next_expected != sequence {
            return Vec::new();
        }
        state.missing.insert(sequence);
        state.next_expected = sequence.next();
        state.last_activity = self.clock.utc();
        warn!(stream = %key, %sequence, "sequence abandoned after dead-letter");
        state.drain_contiguous(None)
    }

    /// Returns streams with at least one held message past its deadline.
    #[must_use]
    pub fn due_streams(&self, now: DateTime<Utc>) -> Vec<StreamKey> {
        self.lock()
            .inbound
            .values()
            .filter(|state| state.has_due(now))
            .map(|state| state.key.clone())
            .collect()
    }

    /// Skips timed-out gaps of one stream and releases what follows them.
    #[must_use]
    pub fn expire_stream(&self, key: &StreamKey, now: DateTime<Utc>) -> Option<GapRelease> {
        let mut streams = self.lock();
        let state = streams.inbound.get_mut(key)?;
        let mut released = Vec::new();
        let mut skipped = Vec::new();
        while state.has_due(now) {
            let gap = state.skip_gap();
            if gap.is_empty() {
                break;
            }
            skipped.extend(gap);
            released.extend(state.drain_contiguous(None));
        }
        if released.is_empty() {
            return None;
        }
        state.last_activity = now;
        warn!(
            stream = %key,
            skipped = ?skipped.iter().map(SequenceNumber::value).collect::<Vec<_>>(),
            released = released.len(),
            "sequence gap timed out; skipping"
        );
        Some(GapRelease {
            key: key.clone(),
            released,
            skipped,
        })
    }

    /// Skips every timed-out gap across all streams.
    #[must_use]
    pub fn expire_due(&self, now: DateTime<Utc>) -> Vec<GapRelease> {
        self.due_streams(now)
            .iter()
            .filter_map(|key| self.expire_stream(key, now))
            .collect()
    }

    /// Forgets a finished stream on both sides.
    pub fn complete(&self, key: &StreamKey) {
        let mut streams = self.lock();
        streams.inbound.remove(key);
        streams.outbound.remove(key);
    }

    /// Drops streams inactive for longer than the idle timeout. Streams
    /// still holding messages are kept until their gaps expire.
    #[must_use = "the collected keys identify streams whose lanes can be dropped"]
    pub fn collect_idle(&self, now: DateTime<Utc>) -> Vec<StreamKey> {
        let idle_timeout = self.settings().idle_timeout;
        let is_idle = |last: DateTime<Utc>| elapsed_between(last, now) >= idle_timeout;
        let mut streams = self.lock();
        let mut collected: Vec<StreamKey> = streams
            .inbound
            .values()
            .filter(|state| state.held.is_empty() && is_idle(state.last_activity))
            .map(|state| state.key.clone())
            .collect();
        for key in &collected {
            streams.inbound.remove(key);
        }
        let idle_outbound: Vec<StreamKey> = streams
            .outbound
            .iter()
            .filter(|(_, counter)| is_idle(counter.last_activity))
            .map(|(key, _)| key.clone())
            .collect();
        for key in idle_outbound {
            streams.outbound.remove(&key);
            if !collected.contains(&key) {
                collected.push(key);
            }
        }
        if !collected.is_empty() {
            debug!(streams = collected.len(), "collected idle sequence streams");
        }
        collected
    }

    /// Returns a copy of a stream's receiver state.
    #[must_use]
    pub fn state(&self, key: &StreamKey) -> Option<WorkflowSequenceState> {
        self.lock().inbound.get(key).cloned()
    }

    /// Returns the number of streams with receiver state.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.lock().inbound.len()
    }

    fn lock(&self) -> MutexGuard<'_, Streams> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
