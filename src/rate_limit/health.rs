//! Health state machine driving adaptive throughput.
//!
//! Outcomes are collected in a rolling window. Once the window holds enough
//! samples, its error rate and p95 latency are compared against the
//! configured thresholds:
//!
//! - `Healthy` moves to `Degraded` on a breach.
//! - `Degraded` moves to `Critical` when a fresh window breaches again.
//! - `Degraded` and `Critical` move to `Recovering` after a cooldown without
//!   breaches.
//! - `Recovering` raises throughput one step per clean interval and becomes
//!   `Healthy` at full throughput; any breach sends it back to `Degraded`.
//!
//! The window is cleared on every state change so that each verdict is based
//! on outcomes observed in the current state.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{elapsed_between, to_time_delta};

/// Full throughput, in percent.
pub const FULL_THROUGHPUT: u8 = 100;

/// Health classification of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Operating normally.
    Healthy,
    /// Thresholds crossed; throughput reduced.
    Degraded,
    /// Sustained breach; throughput severely reduced.
    Critical,
    /// Breaches have stopped; throughput being restored.
    Recovering,
}

impl HealthState {
    /// Returns the canonical string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
            Self::Recovering => "recovering",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trigger points and pacing for the health state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthThresholds {
    /// Error rate, in permille, that counts as a degraded breach.
    pub degraded_error_permille: u32,
    /// Error rate, in permille, that counts as a critical breach.
    pub critical_error_permille: u32,
    /// p95 latency that counts as a degraded breach.
    pub degraded_latency: Duration,
    /// p95 latency that counts as a critical breach.
    pub critical_latency: Duration,
    /// Samples required before a verdict is reached.
    pub min_samples: usize,
    /// Maximum samples kept in the rolling window.
    pub window: usize,
    /// Time without breaches before recovery starts.
    pub cooldown: Duration,
    /// Clean time per recovery step.
    pub recovery_interval: Duration,
    /// Throughput restored per recovery step, in percent.
    pub recovery_step_percent: u8,
    /// Throughput while degraded, in percent.
    pub degraded_percent: u8,
    /// Throughput while critical, in percent.
    pub critical_percent: u8,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_error_permille: 50,
            critical_error_permille: 150,
            degraded_latency: Duration::from_secs(1),
            critical_latency: Duration::from_secs(3),
            min_samples: 10,
            window: 100,
            cooldown: Duration::from_secs(30),
            recovery_interval: Duration::from_secs(10),
            recovery_step_percent: 25,
            degraded_percent: 50,
            critical_percent: 25,
        }
    }
}

/// A health state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    /// Previous state.
    pub from: HealthState,
    /// New state.
    pub to: HealthState,
    /// Throughput now in force, in percent.
    pub throughput_percent: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Sample {
    latency: Duration,
    success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Breach {
    None,
    Degraded,
    Critical,
}

/// Rolling health record of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHealthRecord {
    state: HealthState,
    samples: VecDeque<Sample>,
    error_permille: u32,
    p95_latency: Duration,
    throughput_percent: u8,
    last_transition_at: DateTime<Utc>,
    last_breach_at: Option<DateTime<Utc>>,
    last_step_at: DateTime<Utc>,
}

impl ServiceHealthRecord {
    /// Creates a healthy record.
    #[must_use]
    pub const fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: HealthState::Healthy,
            samples: VecDeque::new(),
            error_permille: 0,
            p95_latency: Duration::ZERO,
            throughput_percent: FULL_THROUGHPUT,
            last_transition_at: now,
            last_breach_at: None,
            last_step_at: now,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> HealthState {
        self.state
    }

    /// Returns the throughput factor in percent.
    #[must_use]
    pub const fn throughput_percent(&self) -> u8 {
        self.throughput_percent
    }

    /// Returns the error rate of the last evaluated window, in permille.
    #[must_use]
    pub const fn error_permille(&self) -> u32 {
        self.error_permille
    }

    /// Returns the p95 latency of the last evaluated window.
    #[must_use]
    pub const fn p95_latency(&self) -> Duration {
        self.p95_latency
    }

    /// Returns when the state last changed.
    #[must_use]
    pub const fn last_transition_at(&self) -> DateTime<Utc> {
        self.last_transition_at
    }

    /// Records an outcome and re-evaluates the state.
    pub fn record(
        &mut self,
        latency: Duration,
        success: bool,
        now: DateTime<Utc>,
        thresholds: &HealthThresholds,
    ) -> Option<HealthTransition> {
        self.samples.push_back(Sample { latency, success });
        while self.samples.len() > thresholds.window.max(1) {
            self.samples.pop_front();
        }

        match self.evaluate(thresholds) {
            Breach::None => self.tick(now, thresholds),
            breach => self.on_breach(breach, now, thresholds),
        }
    }

    /// Applies time-based transitions (cooldown and recovery steps).
    pub fn tick(
        &mut self,
        now: DateTime<Utc>,
        thresholds: &HealthThresholds,
    ) -> Option<HealthTransition> {
        match self.state {
            HealthState::Healthy => None,
            HealthState::Degraded | HealthState::Critical => {
                let quiet = self
                    .last_breach_at
                    .map_or(Duration::MAX, |breach| elapsed_between(breach, now));
                if quiet >= thresholds.cooldown {
                    self.last_step_at = now;
                    let percent = self.throughput_percent;
                    self.move_to(HealthState::Recovering, percent, now)
                } else {
                    None
                }
            }
            HealthState::Recovering => self.step_recovery(now, thresholds),
        }
    }

    fn step_recovery(
        &mut self,
        now: DateTime<Utc>,
        thresholds: &HealthThresholds,
    ) -> Option<HealthTransition> {
        if thresholds.recovery_interval.is_zero() {
            return self.move_to(HealthState::Healthy, FULL_THROUGHPUT, now);
        }
        let step = to_time_delta(thresholds.recovery_interval);
        while elapsed_between(self.last_step_at, now) >= thresholds.recovery_interval
            && self.throughput_percent < FULL_THROUGHPUT
        {
            self.throughput_percent = self
                .throughput_percent
                .saturating_add(thresholds.recovery_step_percent.max(1))
                .min(FULL_THROUGHPUT);
            self.last_step_at = self.last_step_at.checked_add_signed(step).unwrap_or(now);
        }
        if self.throughput_percent >= FULL_THROUGHPUT {
            self.move_to(HealthState::Healthy, FULL_THROUGHPUT, now)
        } else {
            None
        }
    }

    fn on_breach(
        &mut self,
        breach: Breach,
        now: DateTime<Utc>,
        thresholds: &HealthThresholds,
    ) -> Option<HealthTransition> {
        self.last_breach_at = Some(now);
        self.samples.clear();
        match (self.state, breach) {
            (HealthState::Healthy | HealthState::Recovering, _) => {
                self.move_to(HealthState::Degraded, thresholds.degraded_percent, now)
            }
            (HealthState::Degraded, _) => {
                self.move_to(HealthState::Critical, thresholds.critical_percent, now)
            }
            (HealthState::Critical, _) => None,
        }
    }

    fn evaluate(&mut self, thresholds: &HealthThresholds) -> Breach {
        let total = self.samples.len();
        if total < thresholds.min_samples.max(1) {
            return Breach::None;
        }

        let errors = self.samples.iter().filter(|sample| !sample.success).count();
        self.error_permille = u32::try_from(
            errors
                .saturating_mul(1_000)
                .checked_div(total)
                .unwrap_or(0),
        )
        .unwrap_or(u32::MAX);

        let mut latencies: Vec<Duration> = self.samples.iter().map(|sample| sample.latency).collect();
        latencies.sort_unstable();
        let rank = total.saturating_mul(95).div_ceil(100).saturating_sub(1);
        self.p95_latency = latencies.get(rank).copied().unwrap_or(Duration::ZERO);

        if self.error_permille >= thresholds.critical_error_permille
            || self.p95_latency >= thresholds.critical_latency
        {
            Breach::Critical
        } else if self.error_permille >= thresholds.degraded_error_permille
            || self.p95_latency >= thresholds.degraded_latency
        {
            Breach::Degraded
        } else {
            Breach::None
        }
    }

    fn move_to(
        &mut self,
        to: HealthState,
        throughput_percent: u8,
        now: DateTime<Utc>,
    ) -> Option<HealthTransition> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        self.throughput_percent = throughput_percent.clamp(1, FULL_THROUGHPUT);
        self.last_transition_at = now;
        self.samples.clear();
        Some(HealthTransition {
            from,
            to,
            throughput_percent: self.throughput_percent,
        })
    }
}
