//! In-memory implementation of [`BrokerPort`].
//!
//! Queue semantics: a message published on a topic with no subscriber is
//! held until one subscribes. Each delivery is dispatched on its own tokio
//! task, so handlers may run concurrently and out of order, as they would
//! against a real broker. Faults can be injected to exercise the resilient
//! adapter.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::broker::domain::{ChannelStatus, Delivery, DeliveryId, SubscriptionId, Topic};
use crate::broker::ports::{BrokerPort, DeliveryHandler, TransportError, TransportResult};
use crate::message::domain::Message;

/// Number of calls made to each port operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `connect` calls.
    pub connect: usize,
    /// `publish` calls, including failed ones.
    pub publish: usize,
    /// `subscribe` calls.
    pub subscribe: usize,
    /// `ack` calls.
    pub ack: usize,
    /// `nack` calls.
    pub nack: usize,
}

#[derive(Default)]
struct BrokerState {
    connected: bool,
    subscriptions: HashMap<SubscriptionId, (Topic, Arc<dyn DeliveryHandler>)>,
    outstanding: HashMap<DeliveryId, Delivery>,
    waiting: Vec<Delivery>,
    published: Vec<(Topic, Message)>,
    acked: Vec<DeliveryId>,
    rejected: Vec<DeliveryId>,
    publish_faults: VecDeque<TransportError>,
    persistent_publish_fault: Option<TransportError>,
    connect_faults: u32,
    channels: Vec<ChannelStatus>,
    calls: CallCounts,
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Thread-safe in-memory broker for tests and embedding.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    in_flight: Arc<InFlight>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Creates a disconnected broker with one open channel.
    #[must_use]
    pub fn new() -> Self {
        let state = BrokerState {
            channels: vec![ChannelStatus {
                name: "default".to_owned(),
                open: true,
            }],
            ..BrokerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Makes the next `count` publishes fail with `error`.
    pub fn fail_next_publishes(&self, count: usize, error: &TransportError) {
        let mut state = self.lock();
        state
            .publish_faults
            .extend(std::iter::repeat_n(error.clone(), count));
    }

    /// Makes every publish fail with `error` until cleared with `None`.
    pub fn fail_all_publishes(&self, error: Option<TransportError>) {
        self.lock().persistent_publish_fault = error;
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().connect_faults = count;
    }

    /// Simulates a dropped connection. Subscriptions are lost, as they are
    /// on a real broker.
    pub fn drop_connection(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.subscriptions.clear();
    }

    /// Opens or closes a channel, creating it if needed.
    pub fn set_channel(&self, name: &str, open: bool) {
        let mut state = self.lock();
        if let Some(channel) = state.channels.iter_mut().find(|channel| channel.name == name) {
            channel.open = open;
        } else {
            state.channels.push(ChannelStatus {
                name: name.to_owned(),
                open,
            });
        }
    }

    /// Returns per-operation call counts.
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Returns every successfully published message in order.
    #[must_use]
    pub fn published(&self) -> Vec<(Topic, Message)> {
        self.lock().published.clone()
    }

    /// Returns acknowledged delivery ids in order.
    #[must_use]
    pub fn acked(&self) -> Vec<DeliveryId> {
        self.lock().acked.clone()
    }

    /// Returns deliveries rejected without requeue.
    #[must_use]
    pub fn rejected(&self) -> Vec<DeliveryId> {
        self.lock().rejected.clone()
    }

    /// Returns the number of active subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    /// Re-dispatches a delivery as if the broker redelivered it after a
    /// lost acknowledgement. The attempt counter is incremented.
    ///
    /// Returns `false` if no subscriber is available.
    #[must_use]
    pub fn redeliver(&self, delivery: &Delivery) -> bool {
        let redelivery = delivery.redelivered();
        let target = {
            let mut state = self.lock();
            let target = Self::subscriber_for(&state, &redelivery.topic);
            if target.is_some() {
                state
                    .outstanding
                    .insert(redelivery.id.clone(), redelivery.clone());
            }
            target
        };
        target.is_some_and(|handler| {
            self.dispatch(handler, redelivery);
            true
        })
    }

    /// Waits until no handler is running.
    pub async fn settle(&self) {
        loop {
            let idle = self.in_flight.idle.notified();
            if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    fn dispatch(&self, handler: Arc<dyn DeliveryHandler>, delivery: Delivery) {
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            handler.handle(delivery).await;
            if in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
                in_flight.idle.notify_waiters();
            }
        });
    }

    fn subscriber_for(state: &BrokerState, topic: &Topic) -> Option<Arc<dyn DeliveryHandler>> {
        state
            .subscriptions
            .values()
            .find(|(subscribed, _)| subscribed == topic)
            .map(|(_, handler)| Arc::clone(handler))
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_connection(state: &BrokerState) -> TransportResult<()> {
        if state.connected {
            Ok(())
        } else {
            Err(TransportError::ConnectionLost("not connected".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerPort for InMemoryBroker {
    async fn connect(&self) -> TransportResult<()> {
        let mut state = self.lock();
        state.calls.connect = state.calls.connect.saturating_add(1);
        if state.connect_faults > 0 {
            state.connect_faults -= 1;
            return Err(TransportError::ConnectionLost("connection refused".to_owned()));
        }
        state.connected = true;
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.lock().connected
    }

    async fn publish(&self, topic: &Topic, message: &Message) -> TransportResult<DeliveryId> {
        let (publish_id, targets) = {
            let mut state = self.lock();
            state.calls.publish = state.calls.publish.saturating_add(1);
            Self::require_connection(&state)?;
            if let Some(fault) = state.publish_faults.pop_front() {
                return Err(fault);
            }
            if let Some(fault) = state.persistent_publish_fault.clone() {
                return Err(fault);
            }

            let publish_id = DeliveryId::new();
            state.published.push((topic.clone(), message.clone()));
            let handlers: Vec<Arc<dyn DeliveryHandler>> = state
                .subscriptions
                .values()
                .filter(|(subscribed, _)| subscribed == topic)
                .map(|(_, handler)| Arc::clone(handler))
                .collect();

            if handlers.is_empty() {
                state.waiting.push(Delivery::first(
                    publish_id.clone(),
                    topic.clone(),
                    message.clone(),
                ));
                return Ok(publish_id);
            }

            let mut targets = Vec::with_capacity(handlers.len());
            for (index, handler) in handlers.into_iter().enumerate() {
                let id = if index == 0 {
                    publish_id.clone()
                } else {
                    DeliveryId::new()
                };
                let delivery = Delivery::first(id.clone(), topic.clone(), message.clone());
                state.outstanding.insert(id, delivery.clone());
                targets.push((handler, delivery));
            }
            (publish_id, targets)
        };

        for (handler, delivery) in targets {
            self.dispatch(handler, delivery);
        }
        Ok(publish_id)
    }

    async fn subscribe(
        &self,
        topic: &Topic,
        handler: Arc<dyn DeliveryHandler>,
    ) -> TransportResult<SubscriptionId> {
        let (id, waiting) = {
            let mut state = self.lock();
            state.calls.subscribe = state.calls.subscribe.saturating_add(1);
            Self::require_connection(&state)?;
            let id = SubscriptionId::new();
            state
                .subscriptions
                .insert(id.clone(), (topic.clone(), Arc::clone(&handler)));
            let (ready, rest): (Vec<Delivery>, Vec<Delivery>) = std::mem::take(&mut state.waiting)
                .into_iter()
                .partition(|delivery| &delivery.topic == topic);
            state.waiting = rest;
            for delivery in &ready {
                state.outstanding.insert(delivery.id.clone(), delivery.clone());
            }
            (id, ready)
        };
        for delivery in waiting {
            self.dispatch(Arc::clone(&handler), delivery);
        }
        Ok(id)
    }

    async fn unsubscribe(&self, subscription: &SubscriptionId) -> TransportResult<()> {
        self.lock()
            .subscriptions
            .remove(subscription)
            .map(|_| ())
            .ok_or_else(|| TransportError::UnknownSubscription(subscription.clone()))
    }

    async fn ack(&self, delivery: &DeliveryId) -> TransportResult<()> {
        let mut state = self.lock();
        state.calls.ack = state.calls.ack.saturating_add(1);
        state
            .outstanding
            .remove(delivery)
            .ok_or_else(|| TransportError::UnknownDelivery(delivery.clone()))?;
        state.acked.push(delivery.clone());
        Ok(())
    }

    async fn nack(&self, delivery: &DeliveryId, requeue: bool) -> TransportResult<()> {
        let target = {
            let mut state = self.lock();
            state.calls.nack = state.calls.nack.saturating_add(1);
            let original = state
                .outstanding
                .remove(delivery)
                .ok_or_else(|| TransportError::UnknownDelivery(delivery.clone()))?;
            if !requeue {
                state.rejected.push(delivery.clone());
                return Ok(());
            }
            let redelivery = original.redelivered();
            match Self::subscriber_for(&state, &redelivery.topic) {
                Some(handler) => {
                    state
                        .outstanding
                        .insert(redelivery.id.clone(), redelivery.clone());
                    Some((handler, redelivery))
                }
                None => {
                    state.waiting.push(redelivery);
                    None
                }
            }
        };
        if let Some((handler, redelivery)) = target {
            self.dispatch(handler, redelivery);
        }
        Ok(())
    }

    async fn channels(&self) -> TransportResult<Vec<ChannelStatus>> {
        let state = self.lock();
        Self::require_connection(&state)?;
        Ok(state.channels.clone())
    }

    async fn close(&self) -> TransportResult<()> {
        let mut state = self.lock();
        state.connected = false;
        state.subscriptions.clear();
        Ok(())
    }
}
