//! The delivery bus.
//!
//! Routes messages to registered recipients over the resilient broker,
//! dropping duplicates and releasing each workflow stream strictly in
//! sequence order. A recipient's handler outcome settles the delivery:
//! success acknowledges it, failure rejects it so the broker redelivers or
//! dead-letters it.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use mockable::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ack::AcknowledgmentRecord;
use super::error::BusError;
use super::handler::RecipientHandler;
use crate::broker::domain::{Delivery, DeliveryId, NackDisposition, SubscriptionId, Topic};
use crate::broker::ports::{BrokerPort, DeliveryHandler};
use crate::broker::services::ResilientBroker;
use crate::clock::Timer;
use crate::events::{CoreEvent, EventSink};
use crate::message::domain::{AgentId, GroupId, Message, MessageId};
use crate::sequencing::{Admit, DedupCache, SequenceTracker, StreamKey};

/// Default prefix of per-recipient topics.
pub const DEFAULT_TOPIC_PREFIX: &str = "agents";

/// Default period of the background sweeper.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const UNREGISTERED: &str = "recipient not registered";
const BUFFER_FULL: &str = "holding buffer full";

/// Tunables of a [`DeliveryBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSettings {
    /// Recipient topics are named `{topic_prefix}.{agent}`.
    pub topic_prefix: String,
    /// Period of hold-timeout and idle collection sweeps.
    pub sweep_interval: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_owned(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

struct Sweeper {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct BusCore<P, C>
where
    P: BrokerPort + 'static,
    C: Clock + Send + Sync + 'static,
{
    broker: Arc<ResilientBroker<P, C>>,
    dedup: Arc<DedupCache<C>>,
    tracker: Arc<SequenceTracker<C>>,
    handlers: RwLock<HashMap<AgentId, Arc<dyn RecipientHandler>>>,
    subscriptions: Mutex<HashMap<AgentId, SubscriptionId>>,
    groups: RwLock<HashMap<GroupId, BTreeSet<AgentId>>>,
    records: Mutex<HashMap<MessageId, AcknowledgmentRecord>>,
    lanes: Mutex<HashMap<StreamKey, Arc<tokio::sync::Mutex<()>>>>,
    settings: BusSettings,
    clock: Arc<C>,
    events: Arc<dyn EventSink>,
    closed: AtomicBool,
}

/// Routes messages between agents with ordering and deduplication.
///
/// # Examples
///
/// ```no_run
/// # use std::sync::Arc;
/// # use switchyard::broker::adapters::memory::InMemoryBroker;
/// # use switchyard::delivery::DeliveryBus;
/// # use switchyard::message::domain::Message;
/// # async fn demo(bus: DeliveryBus<InMemoryBroker, mockable::DefaultClock>, message: Message)
/// # -> Result<(), switchyard::delivery::BusError> {
/// let delivery_id = bus.send(message).await?;
/// # let _ = delivery_id;
/// # Ok(())
/// # }
/// ```
pub struct DeliveryBus<P, C>
where
    P: BrokerPort + 'static,
    C: Clock + Send + Sync + 'static,
{
    core: Arc<BusCore<P, C>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<P, C> DeliveryBus<P, C>
where
    P: BrokerPort + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Creates a bus over an already connected broker.
    #[must_use]
    pub fn new(
        broker: Arc<ResilientBroker<P, C>>,
        dedup: Arc<DedupCache<C>>,
        tracker: Arc<SequenceTracker<C>>,
        settings: BusSettings,
        clock: Arc<C>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            core: Arc::new(BusCore {
                broker,
                dedup,
                tracker,
                handlers: RwLock::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                groups: RwLock::new(HashMap::new()),
                records: Mutex::new(HashMap::new()),
                lanes: Mutex::new(HashMap::new()),
                settings,
                clock,
                events,
                closed: AtomicBool::new(false),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Returns the broker adapter the bus publishes through.
    #[must_use]
    pub fn broker(&self) -> &Arc<ResilientBroker<P, C>> {
        &self.core.broker
    }

    /// Returns the duplicate filter.
    #[must_use]
    pub fn dedup(&self) -> &Arc<DedupCache<C>> {
        &self.core.dedup
    }

    /// Returns the sequence tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<SequenceTracker<C>> {
        &self.core.tracker
    }

    /// Returns the topic a recipient consumes from.
    #[must_use]
    pub fn topic_for(&self, recipient: &AgentId) -> Topic {
        self.core.topic_for(recipient)
    }

    /// Registers (or replaces) the handler for an agent.
    ///
    /// The first registration subscribes the agent's topic; messages
    /// queued for the agent start flowing immediately.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] after [`Self::close`], or
    /// [`BusError::Broker`] if the subscription failed.
    pub async fn register_recipient(
        &self,
        agent: impl Into<AgentId>,
        handler: Arc<dyn RecipientHandler>,
    ) -> Result<(), BusError> {
        self.core.ensure_open()?;
        let agent = agent.into();
        let replaced = self
            .core
            .write_handlers()
            .insert(agent.clone(), handler)
            .is_some();
        if replaced {
            info!(%agent, "recipient handler replaced");
            return Ok(());
        }

        let topic = self.core.topic_for(&agent);
        let inbound: Arc<dyn DeliveryHandler> = Arc::new(Inbound {
            core: Arc::downgrade(&self.core),
            recipient: agent.clone(),
        });
        match self.core.broker.subscribe(&topic, inbound).await {
            Ok(subscription) => {
                self.core
                    .lock_subscriptions()
                    .insert(agent.clone(), subscription);
                info!(%agent, %topic, "recipient registered");
                Ok(())
            }
            Err(err) => {
                self.core.write_handlers().remove(&agent);
                Err(err.into())
            }
        }
    }

    /// Removes an agent's handler, its subscription and its group
    /// memberships.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownRecipient`] if the agent is not
    /// registered, or [`BusError::Broker`] if unsubscribing failed.
    pub async fn unregister_recipient(&self, agent: &AgentId) -> Result<(), BusError> {
        self.core
            .write_handlers()
            .remove(agent)
            .ok_or_else(|| BusError::UnknownRecipient(agent.clone()))?;
        for members in self.core.write_groups().values_mut() {
            members.remove(agent);
        }
        let subscription = self.core.lock_subscriptions().remove(agent);
        if let Some(subscription) = subscription {
            self.core.broker.unsubscribe(&subscription).await?;
        }
        info!(%agent, "recipient unregistered");
        Ok(())
    }

    /// Returns the registered agents in sorted order.
    #[must_use]
    pub fn recipients(&self) -> Vec<AgentId> {
        let mut agents: Vec<AgentId> = self.core.read_handlers().keys().cloned().collect();
        agents.sort();
        agents
    }

    /// Defines a group, replacing any previous membership.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownRecipient`] if a member is not registered.
    pub fn create_group(
        &self,
        group: impl Into<GroupId>,
        members: impl IntoIterator<Item = AgentId>,
    ) -> Result<(), BusError> {
        let group = group.into();
        let members: BTreeSet<AgentId> = members.into_iter().collect();
        {
            let handlers = self.core.read_handlers();
            if let Some(unknown) = members.iter().find(|member| !handlers.contains_key(*member)) {
                return Err(BusError::UnknownRecipient(unknown.clone()));
            }
        }
        let size = members.len();
        if self
            .core
            .write_groups()
            .insert(group.clone(), members)
            .is_some()
        {
            warn!(%group, "group redefined");
        }
        debug!(%group, size, "group created");
        Ok(())
    }

    /// Adds a registered agent to an existing group.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownGroup`] or [`BusError::UnknownRecipient`].
    pub fn add_to_group(&self, group: &GroupId, member: AgentId) -> Result<(), BusError> {
        if !self.core.read_handlers().contains_key(&member) {
            return Err(BusError::UnknownRecipient(member));
        }
        let mut groups = self.core.write_groups();
        let members = groups
            .get_mut(group)
            .ok_or_else(|| BusError::UnknownGroup(group.clone()))?;
        members.insert(member);
        Ok(())
    }

    /// Returns a group's members in sorted order.
    #[must_use]
    pub fn group_members(&self, group: &GroupId) -> Option<Vec<AgentId>> {
        self.core
            .read_groups()
            .get(group)
            .map(|members| members.iter().cloned().collect())
    }

    /// Sends a message to its recipient.
    ///
    /// A message that belongs to a workflow and carries no sequence number
    /// is numbered from the stream's outbound counter.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] after [`Self::close`], or
    /// [`BusError::Broker`] if the broker adapter refused the publish.
    pub async fn send(&self, message: Message) -> Result<DeliveryId, BusError> {
        self.core.send(message).await
    }

    /// Sends one copy of a message to every member of a group except the
    /// sender.
    ///
    /// Each copy gets its own identifier and its own per-member sequence
    /// number. Failures for individual members are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnknownGroup`], [`BusError::EmptyGroup`] if only
    /// the sender is a member, or the first failure if no copy was sent.
    pub async fn send_to_group(
        &self,
        message: &Message,
        group: &GroupId,
    ) -> Result<Vec<DeliveryId>, BusError> {
        self.core.ensure_open()?;
        let members = self
            .group_members(group)
            .ok_or_else(|| BusError::UnknownGroup(group.clone()))?;
        let targets: Vec<AgentId> = members
            .into_iter()
            .filter(|member| member != message.sender())
            .collect();
        if targets.is_empty() {
            return Err(BusError::EmptyGroup(group.clone()));
        }

        let mut sent = Vec::with_capacity(targets.len());
        let mut first_failure = None;
        for member in targets {
            match self.core.send(message.for_member(member.clone())).await {
                Ok(delivery_id) => sent.push(delivery_id),
                Err(err) => {
                    warn!(%group, %member, error = %err, "group delivery failed");
                    first_failure.get_or_insert(err);
                }
            }
        }
        match first_failure {
            Some(err) if sent.is_empty() => Err(err),
            _ => Ok(sent),
        }
    }

    /// Returns the records of every unsettled message.
    #[must_use]
    pub fn pending(&self) -> Vec<AcknowledgmentRecord> {
        let mut records: Vec<AcknowledgmentRecord> =
            self.core.lock_records().values().cloned().collect();
        records.sort_by(|left, right| left.last_attempt_at.cmp(&right.last_attempt_at));
        records
    }

    /// Releases every held message whose gap has timed out.
    ///
    /// Returns the number of messages released to recipients.
    pub async fn flush_expired(&self) -> usize {
        self.core.flush_expired().await
    }

    /// Runs one maintenance pass: gap timeouts, idle stream collection and
    /// dedup purging.
    pub async fn sweep(&self) {
        self.core.sweep().await;
    }

    /// Starts the background sweeper. Calling it again is a no-op.
    pub fn spawn_sweeper(&self, timer: Arc<dyn Timer>) {
        let mut slot = self.lock_sweeper();
        if slot.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let core = Arc::downgrade(&self.core);
        let interval = self.core.settings.sweep_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    () = timer.sleep(interval) => {}
                }
                let Some(live) = core.upgrade() else { break };
                live.sweep().await;
            }
            debug!("delivery sweeper stopped");
        });
        *slot = Some(Sweeper { token, handle });
    }

    /// Stops the sweeper and closes the broker adapter.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Broker`] if the broker failed to close.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let sweeper = self.lock_sweeper().take();
        if let Some(Sweeper { token, handle }) = sweeper {
            token.cancel();
            if let Err(err) = handle.await {
                warn!(error = %err, "delivery sweeper ended abnormally");
            }
        }
        self.core.broker.close().await?;
        info!("delivery bus closed");
        Ok(())
    }

    fn lock_sweeper(&self) -> MutexGuard<'_, Option<Sweeper>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P, C> BusCore<P, C>
where
    P: BrokerPort + 'static,
    C: Clock + Send + Sync + 'static,
{
    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BusError::Closed)
        } else {
            Ok(())
        }
    }

    fn topic_for(&self, recipient: &AgentId) -> Topic {
        Topic::new(format!("{}.{recipient}", self.settings.topic_prefix))
    }

    async fn send(&self, message: Message) -> Result<DeliveryId, BusError> {
        self.ensure_open()?;
        let sequenced = match (StreamKey::for_message(&message), message.sequence()) {
            (Some(key), None) => {
                let sequence = self.tracker.assign(&key, message.id());
                message.with_sequence(sequence)?
            }
            _ => message,
        };
        let message_id = sequenced.id().clone();
        self.lock_records().insert(
            message_id.clone(),
            AcknowledgmentRecord::pending(message_id.clone(), self.clock.utc()),
        );

        let topic = self.topic_for(sequenced.recipient());
        match self.broker.publish(&topic, &sequenced).await {
            Ok(delivery_id) => {
                if let Some(record) = self.lock_records().get_mut(&message_id)
                    && record.delivery_id.is_none()
                {
                    record.delivery_id = Some(delivery_id.clone());
                }
                debug!(%message_id, %topic, sequence = ?sequenced.sequence(), "message sent");
                Ok(delivery_id)
            }
            Err(err) => {
                self.lock_records().remove(&message_id);
                Err(err.into())
            }
        }
    }

    async fn receive(&self, recipient: &AgentId, delivery: Delivery) {
        let message_id = delivery.message.id().clone();
        self.events.emit(CoreEvent::DeliveryAttempted {
            message_id: message_id.clone(),
            delivery_id: delivery.id.clone(),
            attempt: delivery.attempt,
        });
        self.observe(&delivery);

        if self.dedup.check_and_mark(&message_id).is_duplicate() {
            self.events.emit(CoreEvent::DuplicateDropped {
                message_id: message_id.clone(),
            });
            self.settle(&delivery).await;
            return;
        }

        let Some(handler) = self.handler_for(recipient) else {
            warn!(%recipient, %message_id, "delivery for unregistered recipient");
            let _released = self.dedup.release(&message_id);
            self.reject(&delivery, UNREGISTERED).await;
            return;
        };

        let stream = StreamKey::for_message(&delivery.message);
        let lane = stream.as_ref().map(|key| self.lane(key));
        let _turn = match &lane {
            Some(lane) => Some(lane.lock().await),
            None => None,
        };

        match self.tracker.admit(delivery) {
            Admit::Deliver(batch) => self.dispatch(&handler, stream.as_ref(), batch).await,
            Admit::Held => debug!(%message_id, "held until the gap before it fills"),
            Admit::Stale(stale) => {
                if let Some(sequence) = stale.message.sequence() {
                    self.events.emit(CoreEvent::StaleDropped {
                        message_id,
                        sequence,
                    });
                }
                self.settle(&stale).await;
            }
            Admit::Overflow(refused) => {
                let _released = self.dedup.release(&message_id);
                self.reject(&refused, BUFFER_FULL).await;
            }
        }
    }

    /// Hands a contiguous batch to the recipient in order. Must be called
    /// with the stream's lane held.
    async fn dispatch(
        &self,
        handler: &Arc<dyn RecipientHandler>,
        stream: Option<&StreamKey>,
        batch: Vec<Delivery>,
    ) {
        let mut queue = VecDeque::from(batch);
        while let Some(delivery) = queue.pop_front() {
            match handler.handle(&delivery.message).await {
                Ok(reply) => {
                    self.settle(&delivery).await;
                    if let Some(reply) = reply {
                        let reply_id = reply.id().clone();
                        if let Err(err) = self.send(reply).await {
                            error!(message_id = %reply_id, error = %err, "reply could not be sent");
                        }
                    }
                }
                Err(err) => {
                    let undelivered: Vec<Delivery> = queue.drain(..).collect();
                    let released = self
                        .recover(stream, &delivery, &err.to_string(), undelivered)
                        .await;
                    queue.extend(released);
                }
            }
        }
    }

    /// Undoes the bookkeeping of a failed handler call and rejects the
    /// delivery. Returns deliveries freed by abandoning a dead-lettered
    /// sequence number.
    async fn recover(
        &self,
        stream: Option<&StreamKey>,
        delivery: &Delivery,
        reason: &str,
        undelivered: Vec<Delivery>,
    ) -> Vec<Delivery> {
        let message_id = delivery.message.id();
        let _released = self.dedup.release(message_id);
        let sequenced = stream.zip(delivery.message.sequence());
        if let Some((key, sequence)) = sequenced {
            self.tracker.rewind(key, sequence, undelivered);
        } else if !undelivered.is_empty() {
            warn!(%message_id, count = undelivered.len(), "unsequenced batch cut short");
        }

        match self.broker.nack(delivery, reason).await {
            Ok(NackDisposition::Requeued) => {
                if let Some(record) = self.lock_records().get_mut(message_id) {
                    record.reject(reason);
                }
                Vec::new()
            }
            Ok(NackDisposition::DeadLettered) => {
                self.lock_records().remove(message_id);
                let Some((key, sequence)) = sequenced else {
                    return Vec::new();
                };
                self.events.emit(CoreEvent::SequenceGapSkipped {
                    workflow_id: key.workflow.clone(),
                    recipient: key.recipient.clone(),
                    missing: vec![sequence],
                });
                self.tracker.abandon(key, sequence)
            }
            Err(err) => {
                error!(%message_id, error = %err, "rejection failed; awaiting broker redelivery");
                Vec::new()
            }
        }
    }

    async fn flush_expired(&self) -> usize {
        let now = self.clock.utc();
        let mut released = 0_usize;
        for key in self.tracker.due_streams(now) {
            let lane = self.lane(&key);
            let _turn = lane.lock().await;
            let Some(release) = self.tracker.expire_stream(&key, now) else {
                continue;
            };
            self.events.emit(CoreEvent::SequenceGapSkipped {
                workflow_id: key.workflow.clone(),
                recipient: key.recipient.clone(),
                missing: release.skipped,
            });
            released = released.saturating_add(release.released.len());
            match self.handler_for(&key.recipient) {
                Some(handler) => self.dispatch(&handler, Some(&key), release.released).await,
                None => {
                    for orphan in release.released {
                        let _forgotten = self.dedup.release(orphan.message.id());
                        self.reject(&orphan, UNREGISTERED).await;
                    }
                }
            }
        }
        released
    }

    async fn sweep(&self) {
        let released = self.flush_expired().await;
        let idle = self.tracker.collect_idle(self.clock.utc());
        if !idle.is_empty() {
            let mut lanes = self.lock_lanes();
            for key in &idle {
                lanes.remove(key);
            }
        }
        let purged = self.dedup.purge_expired();
        if released > 0 || !idle.is_empty() || purged > 0 {
            debug!(released, idle = idle.len(), purged, "delivery sweep");
        }
    }

    async fn settle(&self, delivery: &Delivery) {
        match self.broker.ack(delivery).await {
            Ok(()) => {
                self.lock_records().remove(delivery.message.id());
            }
            Err(err) => {
                warn!(message_id = %delivery.message.id(), error = %err, "acknowledgement failed");
            }
        }
    }

    async fn reject(&self, delivery: &Delivery, reason: &str) {
        let message_id = delivery.message.id();
        match self.broker.nack(delivery, reason).await {
            Ok(NackDisposition::Requeued) => {
                if let Some(record) = self.lock_records().get_mut(message_id) {
                    record.reject(reason);
                }
            }
            Ok(NackDisposition::DeadLettered) => {
                self.lock_records().remove(message_id);
            }
            Err(err) => warn!(%message_id, error = %err, "rejection failed"),
        }
    }

    fn observe(&self, delivery: &Delivery) {
        let now = self.clock.utc();
        self.lock_records()
            .entry(delivery.message.id().clone())
            .or_insert_with(|| AcknowledgmentRecord::pending(delivery.message.id().clone(), now))
            .observe(delivery, now);
    }

    fn handler_for(&self, recipient: &AgentId) -> Option<Arc<dyn RecipientHandler>> {
        self.read_handlers().get(recipient).map(Arc::clone)
    }

    fn lane(&self, key: &StreamKey) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.lock_lanes().entry(key.clone()).or_default())
    }

    fn read_handlers(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<AgentId, Arc<dyn RecipientHandler>>> {
        self.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_handlers(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<AgentId, Arc<dyn RecipientHandler>>> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_groups(&self) -> std::sync::RwLockReadGuard<'_, HashMap<GroupId, BTreeSet<AgentId>>> {
        self.groups.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_groups(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<GroupId, BTreeSet<AgentId>>> {
        self.groups.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, HashMap<AgentId, SubscriptionId>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<MessageId, AcknowledgmentRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lanes(&self) -> MutexGuard<'_, HashMap<StreamKey, Arc<tokio::sync::Mutex<()>>>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Broker-side subscriber for one recipient.
struct Inbound<P, C>
where
    P: BrokerPort + 'static,
    C: Clock + Send + Sync + 'static,
{
    core: Weak<BusCore<P, C>>,
    recipient: AgentId,
}

#[async_trait]
impl<P, C> DeliveryHandler for Inbound<P, C>
where
    P: BrokerPort + 'static,
    C: Clock + Send + Sync + 'static,
{
    async fn handle(&self, delivery: Delivery) {
        match self.core.upgrade() {
            Some(core) => core.receive(&self.recipient, delivery).await,
            None => debug!(recipient = %self.recipient, "delivery after bus shutdown ignored"),
        }
    }
}
