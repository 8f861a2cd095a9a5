//! Time sources used by every component.
//!
//! Wall-clock reads go through [`mockable::Clock`]. Waits (retry delays,
//! reconnection backoff, rate-limit polling) go through [`Timer`], so a
//! simulated clock can drive every schedule deterministically in tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeDelta, Utc};
use mockable::Clock;

/// Suspends the current task for a duration.
#[async_trait]
pub trait Timer: Send + Sync {
    /// Waits for `duration` to elapse.
    async fn sleep(&self, duration: Duration);
}

/// [`Timer`] backed by the tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A settable clock for deterministic tests.
///
/// `ManualClock` only moves when told to. As a [`Timer`] it advances itself
/// by the requested duration and yields, so code that sleeps through a
/// `ManualClock` observes the passage of time without real waiting.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use mockable::Clock;
/// use switchyard::clock::ManualClock;
///
/// let clock = ManualClock::default();
/// let start = clock.utc();
/// clock.advance(Duration::from_secs(2));
/// assert_eq!((clock.utc() - start).num_seconds(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    #[must_use]
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        if let Ok(mut now) = self.now.lock()
            && let Some(next) = now.checked_add_signed(to_time_delta(duration))
        {
            *now = next;
        }
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = instant;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(DateTime::<Utc>::UNIX_EPOCH + TimeDelta::days(20_000))
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        self.now
            .lock()
            .map_or(DateTime::<Utc>::UNIX_EPOCH, |now| *now)
    }
}

#[async_trait]
impl Timer for ManualClock {
    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Converts a std duration to a chrono delta, saturating at the maximum.
#[must_use]
pub fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Returns the non-negative time elapsed from `earlier` to `later`.
#[must_use]
pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}
