//! Retry delays and explicit retry schedules.
//!
//! [`BackoffPolicy`] computes the delay for attempt `n` as
//! `first × factor^n`, clamped to `max`, and then applies jitter. The base is
//! derived from the attempt number alone, so jitter never feeds back into
//! later delays.
//!
//! [`RetrySchedule`] is the state of one retry loop: how many attempts were
//! made, when the first failure happened and when the next attempt is due.
//! Callers wait for the due time through a [`crate::clock::Timer`], which
//! keeps retries testable with a simulated clock.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use switchyard::broker::services::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(100),
//!     max: Duration::from_secs(1),
//!     factor: 2,
//!     jitter: JitterPolicy::None,
//! };
//!
//! assert_eq!(backoff.next(0), Duration::from_millis(100));
//! assert_eq!(backoff.next(2), Duration::from_millis(400));
//! assert_eq!(backoff.next(10), Duration::from_secs(1));
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::clock::{elapsed_between, to_time_delta};

/// Randomisation applied to backoff delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterPolicy {
    /// Exact delays.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay/2` plus uniform in `[0, delay/2]`.
    Equal,
}

impl JitterPolicy {
    /// Applies jitter to `delay`.
    #[must_use]
    pub fn apply(self, delay: Duration) -> Duration {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        match self {
            Self::None => delay,
            Self::Full => Duration::from_millis(rng.gen_range(0..=millis)),
            Self::Equal => {
                let half = millis.checked_div(2).unwrap_or(0);
                let spread = if half == 0 { 0 } else { rng.gen_range(0..=half) };
                Duration::from_millis(half.saturating_add(spread))
            }
        }
    }
}

/// Exponential backoff with a cap and jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    /// Multiplicative growth per attempt.
    pub factor: u32,
    /// Jitter applied after clamping.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(30),
            factor: 2,
            jitter: JitterPolicy::Equal,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-indexed).
    #[must_use]
    pub fn next(&self, attempt: u32) -> Duration {
        let multiplier = self.factor.max(1).checked_pow(attempt).unwrap_or(u32::MAX);
        let base = self.first.checked_mul(multiplier).unwrap_or(self.max).min(self.max);
        self.jitter.apply(base)
    }
}

/// State of a bounded retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    policy: BackoffPolicy,
    max_attempts: u32,
    attempts_made: u32,
    first_failure_at: Option<DateTime<Utc>>,
    next_attempt_at: Option<DateTime<Utc>>,
}

impl RetrySchedule {
    /// Creates a schedule allowing `max_attempts` attempts in total.
    #[must_use]
    pub const fn new(max_attempts: u32, policy: BackoffPolicy) -> Self {
        Self {
            policy,
            max_attempts,
            attempts_made: 0,
            first_failure_at: None,
            next_attempt_at: None,
        }
    }

    /// Attempts made so far.
    #[must_use]
    pub const fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    /// When the first failure was recorded.
    #[must_use]
    pub const fn first_failure_at(&self) -> Option<DateTime<Utc>> {
        self.first_failure_at
    }

    /// When the next attempt is due, if one remains.
    #[must_use]
    pub const fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.next_attempt_at
    }

    /// Returns `true` once every attempt has been used.
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.attempts_made >= self.max_attempts
    }

    /// Records a failed attempt at `now` and returns when the next attempt
    /// is due, or `None` if the schedule is exhausted.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.attempts_made = self.attempts_made.saturating_add(1);
        self.first_failure_at.get_or_insert(now);
        self.next_attempt_at = if self.is_exhausted() {
            None
        } else {
            let delay = self.policy.next(self.attempts_made.saturating_sub(1));
            now.checked_add_signed(to_time_delta(delay))
        };
        self.next_attempt_at
    }

    /// Time left until the next attempt is due.
    #[must_use]
    pub fn wait_from(&self, now: DateTime<Utc>) -> Duration {
        self.next_attempt_at
            .map_or(Duration::ZERO, |due| elapsed_between(now, due))
    }
}
