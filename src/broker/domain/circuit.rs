//! Circuit breaker state machine.
//!
//! ```text
//!            failures >= threshold          recovery timeout
//!   Closed ───────────────────────► Open ─────────────────► HalfOpen
//!     ▲                              ▲                         │
//!     │          probe succeeds      │     probe fails         │
//!     └──────────────────────────────┼─────────────────────────┤
//!                                    └─────────────────────────┘
//! ```
//!
//! [`CircuitState`] is pure data: it is driven with explicit timestamps so
//! that callers decide where the lock lives and which clock is used.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::elapsed_between;

/// Phase of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitPhase {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// A single probe call is allowed through.
    HalfOpen,
}

impl CircuitPhase {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds for a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before admitting a probe.
    pub recovery_timeout: Duration,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// A phase change produced by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitTransition {
    /// Phase before the change.
    pub from: CircuitPhase,
    /// Phase after the change.
    pub to: CircuitPhase,
}

/// Decision for a call attempting to pass the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed circuit; the call proceeds normally.
    Pass,
    /// The call is the single half-open probe.
    Probe,
    /// The call must fail fast.
    Rejected {
        /// Time left until a probe may be admitted.
        retry_after: Duration,
    },
}

/// Mutable circuit breaker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitState {
    phase: CircuitPhase,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitState {
    /// Creates a closed circuit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            phase: CircuitPhase::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    /// Returns the current phase.
    #[must_use]
    pub const fn phase(&self) -> CircuitPhase {
        self.phase
    }

    /// Returns the consecutive failure count.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Returns the timestamp of the most recent failure.
    #[must_use]
    pub const fn last_failure_at(&self) -> Option<DateTime<Utc>> {
        self.last_failure_at
    }

    /// Decides whether a call may proceed at `now`.
    ///
    /// Moving from open to half-open happens here, lazily, on the first call
    /// after the recovery timeout.
    pub fn admit(
        &mut self,
        now: DateTime<Utc>,
        settings: &CircuitSettings,
    ) -> (Admission, Option<CircuitTransition>) {
        match self.phase {
            CircuitPhase::Closed => (Admission::Pass, None),
            CircuitPhase::Open => {
                let waited = self
                    .opened_at
                    .map_or(settings.recovery_timeout, |opened| {
                        elapsed_between(opened, now)
                    });
                if waited >= settings.recovery_timeout {
                    self.probe_in_flight = true;
                    let transition = self.move_to(CircuitPhase::HalfOpen);
                    (Admission::Probe, transition)
                } else {
                    let retry_after = settings.recovery_timeout.saturating_sub(waited);
                    (Admission::Rejected { retry_after }, None)
                }
            }
            CircuitPhase::HalfOpen if self.probe_in_flight => (
                Admission::Rejected {
                    retry_after: Duration::ZERO,
                },
                None,
            ),
            CircuitPhase::HalfOpen => {
                self.probe_in_flight = true;
                (Admission::Probe, None)
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&mut self, admission: Admission) -> Option<CircuitTransition> {
        match (self.phase, admission) {
            (CircuitPhase::HalfOpen, Admission::Probe) => {
                self.probe_in_flight = false;
                self.consecutive_failures = 0;
                self.opened_at = None;
                self.move_to(CircuitPhase::Closed)
            }
            (CircuitPhase::Closed, _) => {
                self.consecutive_failures = 0;
                None
            }
            _ => None,
        }
    }

    /// Records a failed call at `now`.
    pub fn record_failure(
        &mut self,
        admission: Admission,
        now: DateTime<Utc>,
        settings: &CircuitSettings,
    ) -> Option<CircuitTransition> {
        self.last_failure_at = Some(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match (self.phase, admission) {
            (CircuitPhase::Closed, _)
                if self.consecutive_failures >= settings.failure_threshold =>
            {
                self.opened_at = Some(now);
                self.move_to(CircuitPhase::Open)
            }
            (CircuitPhase::HalfOpen, Admission::Probe) => {
                self.probe_in_flight = false;
                self.opened_at = Some(now);
                self.move_to(CircuitPhase::Open)
            }
            _ => None,
        }
    }

    /// Releases a probe slot whose call ended without an outcome.
    pub const fn abandon(&mut self, admission: Admission) {
        if matches!(admission, Admission::Probe) {
            self.probe_in_flight = false;
        }
    }

    const fn move_to(&mut self, to: CircuitPhase) -> Option<CircuitTransition> {
        let from = self.phase;
        self.phase = to;
        Some(CircuitTransition { from, to })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, to_time_delta};
    use mockable::Clock;
    use rstest::{fixture, rstest};

    #[fixture]
    fn settings() -> CircuitSettings {
        CircuitSettings {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(10),
        }
    }

    fn trip(state: &mut CircuitState, now: DateTime<Utc>, settings: &CircuitSettings) {
        for _ in 0..settings.failure_threshold {
            let (admission, _) = state.admit(now, settings);
            state.record_failure(admission, now, settings);
        }
    }

    #[rstest]
    fn opens_after_threshold_consecutive_failures(settings: CircuitSettings) {
        let now = ManualClock::default().utc();
        let mut state = CircuitState::new();

        trip(&mut state, now, &settings);

        assert_eq!(state.phase(), CircuitPhase::Open);
        assert!(matches!(
            state.admit(now, &settings).0,
            Admission::Rejected { .. }
        ));
    }

    #[rstest]
    fn success_resets_the_failure_count(settings: CircuitSettings) {
        let now = ManualClock::default().utc();
        let mut state = CircuitState::new();

        state.record_failure(Admission::Pass, now, &settings);
        state.record_failure(Admission::Pass, now, &settings);
        state.record_success(Admission::Pass);
        state.record_failure(Admission::Pass, now, &settings);

        assert_eq!(state.phase(), CircuitPhase::Closed);
        assert_eq!(state.consecutive_failures(), 1);
    }

    #[rstest]
    fn admits_exactly_one_probe_after_recovery_timeout(settings: CircuitSettings) {
        let start = ManualClock::default().utc();
        let mut state = CircuitState::new();
        trip(&mut state, start, &settings);

        let later = start + to_time_delta(settings.recovery_timeout);
        let (first, transition) = state.admit(later, &settings);
        let (second, _) = state.admit(later, &settings);

        assert_eq!(first, Admission::Probe);
        assert_eq!(
            transition,
            Some(CircuitTransition {
                from: CircuitPhase::Open,
                to: CircuitPhase::HalfOpen,
            })
        );
        assert!(matches!(second, Admission::Rejected { .. }));
    }

    #[rstest]
    #[case(true, CircuitPhase::Closed)]
    #[case(false, CircuitPhase::Open)]
    fn probe_outcome_decides_next_phase(
        settings: CircuitSettings,
        #[case] succeeds: bool,
        #[case] expected: CircuitPhase,
    ) {
        let start = ManualClock::default().utc();
        let mut state = CircuitState::new();
        trip(&mut state, start, &settings);
        let later = start + to_time_delta(settings.recovery_timeout);
        let (probe, _) = state.admit(later, &settings);

        let transition = if succeeds {
            state.record_success(probe)
        } else {
            state.record_failure(probe, later, &settings)
        };

        assert_eq!(state.phase(), expected);
        assert_eq!(transition.map(|t| t.from), Some(CircuitPhase::HalfOpen));
    }

    #[rstest]
    fn reopened_circuit_waits_a_fresh_timeout(settings: CircuitSettings) {
        let start = ManualClock::default().utc();
        let mut state = CircuitState::new();
        trip(&mut state, start, &settings);
        let probe_at = start + to_time_delta(settings.recovery_timeout);
        let (probe, _) = state.admit(probe_at, &settings);
        state.record_failure(probe, probe_at, &settings);

        let (admission, _) = state.admit(probe_at + to_time_delta(Duration::from_secs(1)), &settings);

        assert_eq!(
            admission,
            Admission::Rejected {
                retry_after: Duration::from_secs(9)
            }
        );
    }

    #[rstest]
    fn abandoned_probe_frees_the_slot(settings: CircuitSettings) {
        let start = ManualClock::default().utc();
        let mut state = CircuitState::new();
        trip(&mut state, start, &settings);
        let later = start + to_time_delta(settings.recovery_timeout);
        let (probe, _) = state.admit(later, &settings);

        state.abandon(probe);

        assert_eq!(state.admit(later, &settings).0, Admission::Probe);
    }
}
