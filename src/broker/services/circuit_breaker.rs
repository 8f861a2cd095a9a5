//! Lock-guarded circuit breaker.
//!
//! The mutex protects only the state transition. Callers take a
//! [`CircuitPermit`] before I/O and settle it afterwards, so no lock is held
//! while the transport call is in flight.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use mockable::Clock;
use tracing::debug;

use crate::broker::domain::{Admission, CircuitPhase, CircuitSettings, CircuitState, CircuitTransition};
use crate::broker::error::BrokerError;
use crate::events::{CoreEvent, EventSink};

/// Circuit breaker guarding one connection.
pub struct CircuitBreaker<C: Clock + Send + Sync> {
    name: String,
    state: Mutex<CircuitState>,
    settings: RwLock<CircuitSettings>,
    clock: Arc<C>,
    events: Arc<dyn EventSink>,
}

impl<C: Clock + Send + Sync> CircuitBreaker<C> {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        settings: CircuitSettings,
        clock: Arc<C>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CircuitState::new()),
            settings: RwLock::new(settings),
            clock,
            events,
        }
    }

    /// Returns the current phase.
    #[must_use]
    pub fn phase(&self) -> CircuitPhase {
        self.lock().phase()
    }

    /// Replaces thresholds; the current phase is kept.
    pub fn reconfigure(&self, settings: CircuitSettings) {
        *self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Asks to make a call.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::CircuitOpen`] when the call must fail fast.
    pub fn admit(&self) -> Result<CircuitPermit<'_, C>, BrokerError> {
        let settings = self.settings();
        let (admission, transition) = self.lock().admit(self.clock.utc(), &settings);
        self.report(transition);
        match admission {
            Admission::Rejected { retry_after } => {
                debug!(
                    connection = %self.name,
                    retry_after_ms = retry_after.as_millis(),
                    "circuit open, rejecting call"
                );
                Err(BrokerError::CircuitOpen { retry_after })
            }
            admission => Ok(CircuitPermit {
                breaker: self,
                admission,
                settled: false,
            }),
        }
    }

    fn settings(&self) -> CircuitSettings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, transition: Option<CircuitTransition>) {
        if let Some(change) = transition {
            self.events.emit(CoreEvent::CircuitTransitioned {
                resource: self.name.clone(),
                from: change.from,
                to: change.to,
            });
        }
    }
}

/// Permission to make one call through a [`CircuitBreaker`].
///
/// Dropping an unsettled permit releases a half-open probe slot without
/// counting a success or failure.
pub struct CircuitPermit<'a, C: Clock + Send + Sync> {
    breaker: &'a CircuitBreaker<C>,
    admission: Admission,
    settled: bool,
}

impl<C: Clock + Send + Sync> CircuitPermit<'_, C> {
    /// Returns `true` if this call is the half-open probe.
    #[must_use]
    pub const fn is_probe(&self) -> bool {
        matches!(self.admission, Admission::Probe)
    }

    /// Records that the call succeeded.
    pub fn succeed(mut self) {
        self.settled = true;
        let transition = self.breaker.lock().record_success(self.admission);
        self.breaker.report(transition);
    }

    /// Records that the call failed.
    pub fn fail(mut self) {
        self.settled = true;
        let settings = self.breaker.settings();
        let now = self.breaker.clock.utc();
        let transition = self
            .breaker
            .lock()
            .record_failure(self.admission, now, &settings);
        self.breaker.report(transition);
    }
}

impl<C: Clock + Send + Sync> Drop for CircuitPermit<'_, C> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.lock().abandon(self.admission);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::RecordingEventSink;
    use std::time::Duration;

    fn breaker(clock: &ManualClock, events: &RecordingEventSink) -> CircuitBreaker<ManualClock> {
        CircuitBreaker::new(
            "primary",
            CircuitSettings {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(5),
            },
            Arc::new(clock.clone()),
            Arc::new(events.clone()),
        )
    }

    #[test]
    fn emits_each_transition() {
        let clock = ManualClock::default();
        let events = RecordingEventSink::new();
        let breaker = breaker(&clock, &events);

        for _ in 0..2 {
            breaker.admit().expect("closed").fail();
        }
        assert!(matches!(breaker.admit(), Err(BrokerError::CircuitOpen { .. })));

        clock.advance(Duration::from_secs(5));
        let probe = breaker.admit().expect("probe");
        assert!(probe.is_probe());
        probe.succeed();

        let phases: Vec<_> = events
            .events()
            .into_iter()
            .filter_map(|event| match event {
                CoreEvent::CircuitTransitioned { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![CircuitPhase::Open, CircuitPhase::HalfOpen, CircuitPhase::Closed]
        );
    }

    #[test]
    fn dropped_probe_permit_frees_the_slot() {
        let clock = ManualClock::default();
        let events = RecordingEventSink::new();
        let breaker = breaker(&clock, &events);
        for _ in 0..2 {
            breaker.admit().expect("closed").fail();
        }
        clock.advance(Duration::from_secs(5));

        let probe = breaker.admit().expect("probe");
        assert!(breaker.admit().is_err());
        drop(probe);

        assert!(breaker.admit().is_ok());
    }
}
