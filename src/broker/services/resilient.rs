//! Resilient broker adapter.
//!
//! `ResilientBroker` wraps a [`BrokerPort`] with the policies the rest of
//! the system relies on:
//!
//! 1. every publish and subscribe passes the connection's circuit breaker
//! 2. transient publish failures are retried on an explicit schedule, then
//!    dead-lettered
//! 3. a lost connection is re-established with backoff and every active
//!    subscription is restored
//! 4. negatively acknowledged deliveries are requeued until they reach the
//!    attempt limit, then dead-lettered

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use mockable::Clock;
use tracing::{debug, info, warn};

use super::backoff::{BackoffPolicy, RetrySchedule};
use super::circuit_breaker::CircuitBreaker;
use crate::broker::domain::{
    BrokerHealth, CircuitPhase, CircuitSettings, ConnectionStatus, DEFAULT_DEAD_LETTER_PREFIX,
    DeadLetterEntry, Delivery, DeliveryId, NackDisposition, SubscriptionId, Topic,
    dead_letter_destination,
};
use crate::broker::error::{BrokerError, BrokerResult};
use crate::broker::ports::{BrokerPort, DeadLetterSink, DeliveryHandler, TransportError};
use crate::clock::{Timer, elapsed_between};
use crate::events::{CoreEvent, EventSink};
use crate::message::domain::Message;
use crate::rate_limit::AdaptiveRateLimiter;

/// Tunables of a [`ResilientBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    /// Connection name used in events and as the rate-limit resource.
    pub name: String,
    /// Circuit breaker thresholds.
    pub circuit: CircuitSettings,
    /// Total publish attempts before dead-lettering.
    pub publish_attempts: u32,
    /// Delay between publish attempts.
    pub publish_backoff: BackoffPolicy,
    /// Connection attempts per reconnection.
    pub reconnect_attempts: u32,
    /// Delay between connection attempts.
    pub reconnect_backoff: BackoffPolicy,
    /// Delivery attempts before a nacked delivery is dead-lettered.
    pub max_delivery_attempts: u32,
    /// Prefix of dead-letter destinations.
    pub dead_letter_prefix: String,
    /// Consume a rate-limit token per publish when a limiter is attached.
    pub rate_limited: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            name: "primary".to_owned(),
            circuit: CircuitSettings::default(),
            publish_attempts: 3,
            publish_backoff: BackoffPolicy::default(),
            reconnect_attempts: 5,
            reconnect_backoff: BackoffPolicy::default(),
            max_delivery_attempts: 3,
            dead_letter_prefix: DEFAULT_DEAD_LETTER_PREFIX.to_owned(),
            rate_limited: true,
        }
    }
}

struct ActiveSubscription {
    topic: Topic,
    handler: Arc<dyn DeliveryHandler>,
    port_id: SubscriptionId,
}

/// Circuit-breaking, reconnecting, dead-lettering broker adapter.
pub struct ResilientBroker<P, C>
where
    P: BrokerPort,
    C: Clock + Send + Sync,
{
    port: Arc<P>,
    settings: RwLock<BrokerSettings>,
    breaker: CircuitBreaker<C>,
    subscriptions: Mutex<HashMap<SubscriptionId, ActiveSubscription>>,
    first_failures: Mutex<HashMap<DeliveryId, DateTime<Utc>>>,
    dead_letters: Arc<dyn DeadLetterSink>,
    limiter: Option<Arc<AdaptiveRateLimiter<C>>>,
    clock: Arc<C>,
    timer: Arc<dyn Timer>,
    events: Arc<dyn EventSink>,
    reconnecting: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl<P, C> ResilientBroker<P, C>
where
    P: BrokerPort,
    C: Clock + Send + Sync,
{
    /// Creates an adapter over `port`.
    #[must_use]
    pub fn new(
        port: Arc<P>,
        settings: BrokerSettings,
        dead_letters: Arc<dyn DeadLetterSink>,
        clock: Arc<C>,
        timer: Arc<dyn Timer>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            settings.name.clone(),
            settings.circuit,
            Arc::clone(&clock),
            Arc::clone(&events),
        );
        Self {
            port,
            settings: RwLock::new(settings),
            breaker,
            subscriptions: Mutex::new(HashMap::new()),
            first_failures: Mutex::new(HashMap::new()),
            dead_letters,
            limiter: None,
            clock,
            timer,
            events,
            reconnecting: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Attaches a rate limiter consulted on every publish.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<AdaptiveRateLimiter<C>>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Returns the wrapped port.
    #[must_use]
    pub const fn port(&self) -> &Arc<P> {
        &self.port
    }

    /// Returns the circuit breaker phase.
    #[must_use]
    pub fn circuit_phase(&self) -> CircuitPhase {
        self.breaker.phase()
    }

    /// Applies new tunables. The connection name is kept.
    pub fn reconfigure(&self, settings: BrokerSettings) {
        self.breaker.reconfigure(settings.circuit);
        let mut current = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        *current = BrokerSettings {
            name: current.name.clone(),
            ..settings
        };
    }

    /// Establishes the initial connection, with the reconnection policy.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ReconnectFailed`] if every attempt failed.
    pub async fn connect(&self) -> BrokerResult<()> {
        self.reconnect().await
    }

    /// Publishes `message` on `topic`.
    ///
    /// # Errors
    ///
    /// - [`BrokerError::Closed`] after [`Self::close`]
    /// - [`BrokerError::RateLimited`] when the limiter denies the publish
    /// - [`BrokerError::CircuitOpen`] when the breaker fails fast, including
    ///   when it opens between retries
    /// - [`BrokerError::TransportExhausted`] once every attempt failed and
    ///   the message was dead-lettered
    pub async fn publish(&self, topic: &Topic, message: &Message) -> BrokerResult<DeliveryId> {
        self.ensure_open()?;
        let settings = self.settings();
        self.consume_token(&settings)?;

        let mut schedule = RetrySchedule::new(settings.publish_attempts.max(1), settings.publish_backoff);
        loop {
            let permit = self.breaker.admit()?;
            let started = self.clock.utc();
            let outcome = self.port.publish(topic, message).await;
            let latency = elapsed_between(started, self.clock.utc());

            match outcome {
                Ok(delivery_id) => {
                    permit.succeed();
                    self.record_outcome(&settings, latency, true);
                    debug!(%topic, message_id = %message.id(), %delivery_id, "published");
                    return Ok(delivery_id);
                }
                Err(err) if err.is_transient() => {
                    permit.fail();
                    self.record_outcome(&settings, latency, false);
                    let now = self.clock.utc();
                    warn!(
                        %topic,
                        message_id = %message.id(),
                        attempt = schedule.attempts_made().saturating_add(1),
                        error = %err,
                        "publish attempt failed"
                    );
                    if schedule.record_failure(now).is_none() {
                        return Err(self.exhaust(topic, message, &schedule, &err, &settings).await);
                    }
                    if err.is_connection_lost()
                        && let Err(reconnect_err) = self.reconnect().await
                    {
                        warn!(%topic, error = %reconnect_err, "reconnection during publish failed");
                    }
                    self.timer.sleep(schedule.wait_from(self.clock.utc())).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Subscribes `handler` to `topic`; the subscription survives
    /// reconnection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CircuitOpen`] or a transport error.
    pub async fn subscribe(
        &self,
        topic: &Topic,
        handler: Arc<dyn DeliveryHandler>,
    ) -> BrokerResult<SubscriptionId> {
        self.ensure_open()?;
        let permit = self.breaker.admit()?;
        match self.port.subscribe(topic, Arc::clone(&handler)).await {
            Ok(port_id) => {
                permit.succeed();
                let id = SubscriptionId::new();
                self.lock_subscriptions().insert(
                    id.clone(),
                    ActiveSubscription {
                        topic: topic.clone(),
                        handler,
                        port_id,
                    },
                );
                info!(%topic, subscription = %id, "subscribed");
                Ok(id)
            }
            Err(err) => {
                if err.is_transient() {
                    permit.fail();
                }
                Err(err.into())
            }
        }
    }

    /// Removes a subscription.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownSubscription`] if the id is not active.
    pub async fn unsubscribe(&self, subscription: &SubscriptionId) -> BrokerResult<()> {
        let removed = self
            .lock_subscriptions()
            .remove(subscription)
            .ok_or_else(|| BrokerError::UnknownSubscription(subscription.to_string()))?;
        match self.port.unsubscribe(&removed.port_id).await {
            Ok(()) | Err(TransportError::UnknownSubscription(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Acknowledges a delivery.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the broker rejected the acknowledgement.
    pub async fn ack(&self, delivery: &Delivery) -> BrokerResult<()> {
        self.port.ack(&delivery.id).await?;
        self.lock_failures().remove(&delivery.id);
        self.events.emit(CoreEvent::Acknowledged {
            message_id: delivery.message.id().clone(),
            delivery_id: delivery.id.clone(),
        });
        Ok(())
    }

    /// Rejects a delivery, requeueing it or dead-lettering it once it has
    /// reached the attempt limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the dead-letter sink or the broker failed; a
    /// delivery is only rejected without requeue after its dead-letter
    /// entry was recorded.
    pub async fn nack(&self, delivery: &Delivery, reason: &str) -> BrokerResult<NackDisposition> {
        let settings = self.settings();
        let now = self.clock.utc();
        let first_failure_at = *self.lock_failures().entry(delivery.id.clone()).or_insert(now);

        if delivery.attempt < settings.max_delivery_attempts.max(1) {
            self.port.nack(&delivery.id, true).await?;
            self.emit_nack(delivery, reason, true);
            return Ok(NackDisposition::Requeued);
        }

        let destination = dead_letter_destination(&settings.dead_letter_prefix, &delivery.topic);
        self.dead_letters
            .record(DeadLetterEntry {
                message: delivery.message.clone(),
                reason: reason.to_owned(),
                origin: delivery.topic.clone(),
                destination: destination.clone(),
                first_failure_at,
                last_failure_at: now,
                attempts: delivery.attempt,
            })
            .await?;
        self.port.nack(&delivery.id, false).await?;
        self.lock_failures().remove(&delivery.id);
        self.emit_nack(delivery, reason, false);
        self.events.emit(CoreEvent::DeadLettered {
            message_id: delivery.message.id().clone(),
            destination,
            reason: reason.to_owned(),
            attempts: delivery.attempt,
        });
        Ok(NackDisposition::DeadLettered)
    }

    /// Reports connection, channel, subscription and circuit state.
    pub async fn health_check(&self) -> BrokerHealth {
        let connection = if self.port.is_connected().await {
            ConnectionStatus::Open
        } else {
            ConnectionStatus::Closed
        };
        let channels = match connection {
            ConnectionStatus::Open => self.port.channels().await.unwrap_or_default(),
            ConnectionStatus::Closed => Vec::new(),
        };
        let subscriptions = self.lock_subscriptions().len();
        BrokerHealth::assess(connection, channels, subscriptions, self.breaker.phase())
    }

    /// Re-establishes the connection and restores every subscription.
    ///
    /// Concurrent callers share one reconnection; a caller arriving after
    /// another has reconnected returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ReconnectFailed`] if every attempt failed.
    pub async fn reconnect(&self) -> BrokerResult<()> {
        self.ensure_open()?;
        let _serialised = self.reconnecting.lock().await;
        if self.port.is_connected().await {
            return Ok(());
        }

        let settings = self.settings();
        let attempts = settings.reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.port.connect().await {
                Ok(()) => match self.restore_subscriptions().await {
                    Ok(restored) => {
                        info!(connection = %settings.name, attempt, restored, "broker connected");
                        self.events.emit(CoreEvent::Reconnected {
                            resource: settings.name.clone(),
                            attempts: attempt,
                        });
                        return Ok(());
                    }
                    Err(err) => {
                        warn!(connection = %settings.name, attempt, error = %err, "restoring subscriptions failed");
                    }
                },
                Err(err) => {
                    warn!(connection = %settings.name, attempt, error = %err, "connection attempt failed");
                }
            }
            if attempt < attempts {
                self.timer
                    .sleep(settings.reconnect_backoff.next(attempt.saturating_sub(1)))
                    .await;
            }
        }

        self.events.emit(CoreEvent::ReconnectFailed {
            resource: settings.name,
            attempts,
        });
        Err(BrokerError::ReconnectFailed { attempts })
    }

    /// Unsubscribes everything and closes the connection.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the close handshake failed.
    pub async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let port_ids: Vec<SubscriptionId> = self
            .lock_subscriptions()
            .drain()
            .map(|(_, active)| active.port_id)
            .collect();
        for port_id in port_ids {
            if let Err(err) = self.port.unsubscribe(&port_id).await {
                debug!(subscription = %port_id, error = %err, "unsubscribe during close failed");
            }
        }
        self.port.close().await?;
        info!("broker adapter closed");
        Ok(())
    }

    async fn restore_subscriptions(&self) -> Result<usize, TransportError> {
        let active: Vec<(SubscriptionId, Topic, Arc<dyn DeliveryHandler>)> = self
            .lock_subscriptions()
            .iter()
            .map(|(id, sub)| (id.clone(), sub.topic.clone(), Arc::clone(&sub.handler)))
            .collect();
        let restored = active.len();
        for (id, topic, handler) in active {
            let port_id = self.port.subscribe(&topic, handler).await?;
            if let Some(sub) = self.lock_subscriptions().get_mut(&id) {
                sub.port_id = port_id;
            }
        }
        Ok(restored)
    }

    async fn exhaust(
        &self,
        topic: &Topic,
        message: &Message,
        schedule: &RetrySchedule,
        err: &TransportError,
        settings: &BrokerSettings,
    ) -> BrokerError {
        let now = self.clock.utc();
        let destination = dead_letter_destination(&settings.dead_letter_prefix, topic);
        let attempts = schedule.attempts_made();
        let entry = DeadLetterEntry {
            message: message.clone(),
            reason: err.to_string(),
            origin: topic.clone(),
            destination: destination.clone(),
            first_failure_at: schedule.first_failure_at().unwrap_or(now),
            last_failure_at: now,
            attempts,
        };
        if let Err(sink_err) = self.dead_letters.record(entry).await {
            return sink_err.into();
        }
        self.events.emit(CoreEvent::DeadLettered {
            message_id: message.id().clone(),
            destination,
            reason: err.to_string(),
            attempts,
        });
        BrokerError::TransportExhausted {
            attempts,
            reason: err.to_string(),
        }
    }

    fn consume_token(&self, settings: &BrokerSettings) -> BrokerResult<()> {
        match &self.limiter {
            Some(limiter) if settings.rate_limited && !limiter.try_consume(&settings.name, 1) => {
                Err(BrokerError::RateLimited {
                    resource: settings.name.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    fn record_outcome(&self, settings: &BrokerSettings, latency: std::time::Duration, success: bool) {
        if let Some(limiter) = &self.limiter
            && settings.rate_limited
        {
            limiter.record_outcome(&settings.name, latency, success);
        }
    }

    fn emit_nack(&self, delivery: &Delivery, reason: &str, requeued: bool) {
        self.events.emit(CoreEvent::Nacked {
            message_id: delivery.message.id().clone(),
            delivery_id: delivery.id.clone(),
            attempt: delivery.attempt,
            reason: reason.to_owned(),
            requeued,
        });
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn settings(&self) -> BrokerSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_subscriptions(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SubscriptionId, ActiveSubscription>> {
        self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, HashMap<DeliveryId, DateTime<Utc>>> {
        self.first_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
