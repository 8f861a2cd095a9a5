//! Health-aware token-bucket rate limiter.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mockable::Clock;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::bucket::{BucketSettings, TokenBucket};
use super::health::{HealthState, HealthThresholds, HealthTransition, ServiceHealthRecord};
use crate::clock::{Timer, elapsed_between, to_time_delta};
use crate::events::{CoreEvent, EventSink};

/// Upper bound on a single wait inside [`AdaptiveRateLimiter::consume_or_block`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Errors from blocking consumption.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// Tokens did not become available before the timeout.
    #[error("rate limit exceeded for resource '{resource}' after waiting {waited:?}")]
    Timeout {
        /// Throttled resource.
        resource: String,
        /// Time spent waiting.
        waited: Duration,
    },
    /// The request can never be satisfied at the current capacity.
    #[error("resource '{resource}' cannot grant {requested} tokens (capacity {capacity})")]
    ExceedsCapacity {
        /// Throttled resource.
        resource: String,
        /// Tokens requested.
        requested: u64,
        /// Effective capacity.
        capacity: u64,
    },
}

/// Errors from [`AdaptiveRateLimiter::execute`].
#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    /// No token was available; the operation did not run.
    #[error("rate limit exceeded for resource '{resource}'")]
    RateLimited {
        /// Throttled resource.
        resource: String,
    },
    /// The operation ran and failed.
    #[error("rate-limited operation failed: {0}")]
    Failed(#[source] E),
}

/// Point-in-time view of a resource's budget and health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BucketSnapshot {
    /// Resource identifier.
    pub resource: String,
    /// Configured capacity and refill.
    pub settings: BucketSettings,
    /// Capacity in force after health scaling.
    pub effective_capacity: u64,
    /// Whole tokens currently available.
    pub tokens: u64,
    /// Last refill timestamp.
    pub last_refill: DateTime<Utc>,
    /// Health state.
    pub health: HealthState,
    /// Error rate of the last evaluated window, in permille.
    pub error_permille: u32,
    /// p95 latency of the last evaluated window.
    pub p95_latency: Duration,
    /// Throughput factor in percent.
    pub throughput_percent: u8,
}

#[derive(Debug)]
pub(super) struct ResourceState {
    bucket: TokenBucket,
    health: ServiceHealthRecord,
    thresholds: HealthThresholds,
}

enum Attempt {
    Granted,
    Wait(Duration),
    Never(u64),
}

#[derive(Debug, Clone, Copy, Default)]
struct Defaults {
    bucket: BucketSettings,
    thresholds: HealthThresholds,
}

/// Token-bucket limiter whose budgets shrink while a resource is unhealthy.
///
/// Every resource owns one bucket and one health record behind its own
/// mutex. Resources that were never configured get the default bucket on
/// first use.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use switchyard::clock::ManualClock;
/// use switchyard::events::TracingEventSink;
/// use switchyard::rate_limit::{AdaptiveRateLimiter, BucketSettings, RefillRate};
///
/// let clock = ManualClock::default();
/// let limiter = AdaptiveRateLimiter::new(
///     Arc::new(clock.clone()),
///     Arc::new(clock.clone()),
///     Arc::new(TracingEventSink),
/// );
/// limiter.configure("svc", BucketSettings { capacity: 2, refill: RefillRate::per_second(1) });
///
/// assert!(limiter.try_consume("svc", 2));
/// assert!(!limiter.try_consume("svc", 1));
/// clock.advance(Duration::from_secs(1));
/// assert!(limiter.try_consume("svc", 1));
/// ```
pub struct AdaptiveRateLimiter<C: Clock + Send + Sync> {
    resources: RwLock<HashMap<String, Arc<Mutex<ResourceState>>>>,
    defaults: RwLock<Defaults>,
    clock: Arc<C>,
    timer: Arc<dyn Timer>,
    events: Arc<dyn EventSink>,
    poll_interval: Duration,
}

impl<C: Clock + Send + Sync> AdaptiveRateLimiter<C> {
    /// Creates a limiter with the default bucket and thresholds.
    #[must_use]
    pub fn new(clock: Arc<C>, timer: Arc<dyn Timer>, events: Arc<dyn EventSink>) -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
            defaults: RwLock::new(Defaults::default()),
            clock,
            timer,
            events,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the longest single wait while blocking.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Replaces the settings given to resources that were never configured.
    pub fn set_defaults(&self, bucket: BucketSettings, thresholds: HealthThresholds) {
        *self
            .defaults
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Defaults { bucket, thresholds };
    }

    /// Sets a resource's capacity and refill rate.
    ///
    /// A resource seen for the first time starts full at the configured
    /// capacity. Reconfiguring a live resource keeps its current level
    /// (clamped to the new capacity) and its health record.
    pub fn configure(&self, resource: &str, settings: BucketSettings) {
        let now = self.clock.utc();
        let defaults = self.defaults();
        let existing = match self
            .resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(resource.to_owned())
        {
            Entry::Occupied(entry) => Some(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(ResourceState {
                    bucket: TokenBucket::new(settings, now),
                    health: ServiceHealthRecord::new(now),
                    thresholds: defaults.thresholds,
                })));
                None
            }
        };
        if let Some(state) = existing {
            let mut state = Self::lock(&state);
            let percent = state.health.throughput_percent();
            state.bucket.reconfigure(settings, now, percent);
        }
        debug!(resource, capacity = settings.capacity, "rate limit configured");
    }

    /// Sets a resource's health thresholds.
    pub fn configure_health(&self, resource: &str, thresholds: HealthThresholds) {
        let state = self.state_for(resource);
        Self::lock(&state).thresholds = thresholds;
    }

    /// Takes `tokens` if available without waiting.
    #[must_use]
    pub fn try_consume(&self, resource: &str, tokens: u64) -> bool {
        let granted = matches!(self.attempt(resource, tokens), Attempt::Granted);
        if !granted {
            self.deny(resource, tokens);
        }
        granted
    }

    /// Takes `tokens`, waiting up to `timeout` for them to refill.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Timeout`] if the tokens did not become
    /// available in time, or [`RateLimitError::ExceedsCapacity`] if they
    /// never can.
    pub async fn consume_or_block(
        &self,
        resource: &str,
        tokens: u64,
        timeout: Duration,
    ) -> Result<(), RateLimitError> {
        let started = self.clock.utc();
        let deadline = started
            .checked_add_signed(to_time_delta(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        loop {
            let wait = match self.attempt(resource, tokens) {
                Attempt::Granted => return Ok(()),
                Attempt::Never(capacity) => {
                    self.deny(resource, tokens);
                    return Err(RateLimitError::ExceedsCapacity {
                        resource: resource.to_owned(),
                        requested: tokens,
                        capacity,
                    });
                }
                Attempt::Wait(wait) => wait,
            };

            let now = self.clock.utc();
            let remaining = elapsed_between(now, deadline);
            if remaining.is_zero() {
                self.deny(resource, tokens);
                return Err(RateLimitError::Timeout {
                    resource: resource.to_owned(),
                    waited: elapsed_between(started, now),
                });
            }
            let pause = wait
                .min(self.poll_interval)
                .min(remaining)
                .max(Duration::from_millis(1));
            self.timer.sleep(pause).await;
        }
    }

    /// Runs `operation` if a token is available, recording its latency and
    /// outcome against the resource's health.
    ///
    /// # Errors
    ///
    /// Returns [`ExecuteError::RateLimited`] without running the operation
    /// when no token is available, or [`ExecuteError::Failed`] with the
    /// operation's own error.
    pub async fn execute<T, E, F>(&self, resource: &str, operation: F) -> Result<T, ExecuteError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.try_consume(resource, 1) {
            return Err(ExecuteError::RateLimited {
                resource: resource.to_owned(),
            });
        }
        let started = self.clock.utc();
        let result = operation.await;
        let latency = elapsed_between(started, self.clock.utc());
        self.record_outcome(resource, latency, result.is_ok());
        result.map_err(ExecuteError::Failed)
    }

    /// Feeds one call outcome into the resource's health record.
    pub fn record_outcome(&self, resource: &str, latency: Duration, success: bool) {
        let now = self.clock.utc();
        let state = self.state_for(resource);
        let transition = {
            let mut state = Self::lock(&state);
            let thresholds = state.thresholds;
            let transition = state.health.record(latency, success, now, &thresholds);
            Self::rescale(&mut state, transition, now);
            transition
        };
        self.report(resource, transition);
    }

    /// Returns the resource's current health state.
    #[must_use]
    pub fn health(&self, resource: &str) -> HealthState {
        let now = self.clock.utc();
        let state = self.state_for(resource);
        let (current, transition) = {
            let mut state = Self::lock(&state);
            let transition = Self::tick(&mut state, now);
            (state.health.state(), transition)
        };
        self.report(resource, transition);
        current
    }

    /// Returns a snapshot of the resource's bucket and health.
    #[must_use]
    pub fn snapshot(&self, resource: &str) -> Option<BucketSnapshot> {
        let now = self.clock.utc();
        let state = self.state_for(resource);
        let mut state = Self::lock(&state);
        let transition = Self::tick(&mut state, now);
        let percent = state.health.throughput_percent();
        let snapshot = BucketSnapshot {
            resource: resource.to_owned(),
            settings: state.bucket.settings(),
            effective_capacity: state.bucket.effective_capacity(percent),
            tokens: state.bucket.available(now, percent),
            last_refill: state.bucket.last_refill(),
            health: state.health.state(),
            error_permille: state.health.error_permille(),
            p95_latency: state.health.p95_latency(),
            throughput_percent: percent,
        };
        drop(state);
        self.report(resource, transition);
        Some(snapshot)
    }

    fn attempt(&self, resource: &str, tokens: u64) -> Attempt {
        let now = self.clock.utc();
        let state = self.state_for(resource);
        let mut guard = Self::lock(&state);
        let transition = Self::tick(&mut guard, now);
        let percent = guard.health.throughput_percent();
        let outcome = if guard.bucket.try_consume(tokens, now, percent) {
            Attempt::Granted
        } else {
            match guard.bucket.time_until(tokens, now, percent) {
                Some(wait) => Attempt::Wait(wait),
                None => Attempt::Never(guard.bucket.effective_capacity(percent)),
            }
        };
        drop(guard);
        self.report(resource, transition);
        outcome
    }

    fn tick(state: &mut ResourceState, now: DateTime<Utc>) -> Option<HealthTransition> {
        let thresholds = state.thresholds;
        let transition = state.health.tick(now, &thresholds);
        Self::rescale(state, transition, now);
        transition
    }

    fn rescale(state: &mut ResourceState, transition: Option<HealthTransition>, now: DateTime<Utc>) {
        if let Some(change) = transition {
            let settings = state.bucket.settings();
            state
                .bucket
                .reconfigure(settings, now, change.throughput_percent);
        }
    }

    fn report(&self, resource: &str, transition: Option<HealthTransition>) {
        if let Some(change) = transition {
            self.events.emit(CoreEvent::HealthTransitioned {
                resource: resource.to_owned(),
                from: change.from,
                to: change.to,
                throughput_percent: change.throughput_percent,
            });
        }
    }

    fn deny(&self, resource: &str, tokens: u64) {
        self.events.emit(CoreEvent::RateLimitDenied {
            resource: resource.to_owned(),
            requested: tokens,
        });
    }

    fn lock(state: &Mutex<ResourceState>) -> MutexGuard<'_, ResourceState> {
        state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn defaults(&self) -> Defaults {
        *self.defaults.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn existing_state(&self, resource: &str) -> Option<Arc<Mutex<ResourceState>>> {
        self.resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .map(Arc::clone)
    }

    pub(super) fn state_for(&self, resource: &str) -> Arc<Mutex<ResourceState>> {
        if let Some(state) = self.existing_state(resource) {
            return state;
        }

        let defaults = self.defaults();
        let now = self.clock.utc();
        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(resources.entry(resource.to_owned()).or_insert_with(|| {
            Arc::new(Mutex::new(ResourceState {
                bucket: TokenBucket::new(defaults.bucket, now),
                health: ServiceHealthRecord::new(now),
                thresholds: defaults.thresholds,
            }))
        }))
    }
}
