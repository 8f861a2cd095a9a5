//! Token bucket with lazy continuous refill.
//!
//! Token levels are tracked in thousandths of a token so that slow refill
//! rates accumulate without floating-point arithmetic. Refill happens only
//! when the bucket is observed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::elapsed_between;

const MILLI: u128 = 1_000;
const PERCENT: u128 = 100;

/// Tokens added to a bucket per interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefillRate {
    /// Tokens added per interval.
    pub tokens: u64,
    /// Length of the interval.
    pub per: Duration,
}

impl RefillRate {
    /// `tokens` per second.
    #[must_use]
    pub const fn per_second(tokens: u64) -> Self {
        Self {
            tokens,
            per: Duration::from_secs(1),
        }
    }
}

/// Capacity and refill rate of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSettings {
    /// Maximum number of whole tokens.
    pub capacity: u64,
    /// Refill rate.
    pub refill: RefillRate,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill: RefillRate::per_second(1),
        }
    }
}

/// Token bucket state for one resource.
///
/// # Invariants
///
/// `0 <= tokens <= capacity` at every observation, where capacity is the
/// configured capacity scaled by the throughput factor in force.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucket {
    settings: BucketSettings,
    level_milli: u128,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(settings: BucketSettings, now: DateTime<Utc>) -> Self {
        Self {
            settings,
            level_milli: u128::from(settings.capacity).saturating_mul(MILLI),
            last_refill: now,
        }
    }

    /// Returns the configured settings.
    #[must_use]
    pub const fn settings(&self) -> BucketSettings {
        self.settings
    }

    /// Returns the timestamp of the last refill.
    #[must_use]
    pub const fn last_refill(&self) -> DateTime<Utc> {
        self.last_refill
    }

    /// Replaces capacity and refill rate, keeping the current level within
    /// the new capacity.
    pub fn reconfigure(&mut self, settings: BucketSettings, now: DateTime<Utc>, percent: u8) {
        self.refill(now, percent);
        self.settings = settings;
        self.level_milli = self.level_milli.min(self.capacity_milli(percent));
    }

    /// Whole tokens available after refilling to `now`.
    pub fn available(&mut self, now: DateTime<Utc>, percent: u8) -> u64 {
        self.refill(now, percent);
        to_u64(self.level_milli.checked_div(MILLI).unwrap_or(0))
    }

    /// Effective capacity in whole tokens under `percent` throughput.
    #[must_use]
    pub fn effective_capacity(&self, percent: u8) -> u64 {
        to_u64(self.capacity_milli(percent).checked_div(MILLI).unwrap_or(0))
    }

    /// Removes `tokens` if available.
    pub fn try_consume(&mut self, tokens: u64, now: DateTime<Utc>, percent: u8) -> bool {
        self.refill(now, percent);
        let needed = u128::from(tokens).saturating_mul(MILLI);
        if needed > self.level_milli {
            return false;
        }
        self.level_milli -= needed;
        true
    }

    /// Time until `tokens` become available, or `None` if they never can.
    pub fn time_until(&mut self, tokens: u64, now: DateTime<Utc>, percent: u8) -> Option<Duration> {
        self.refill(now, percent);
        let needed = u128::from(tokens).saturating_mul(MILLI);
        if needed > self.capacity_milli(percent) {
            return None;
        }
        let deficit = needed.saturating_sub(self.level_milli);
        if deficit == 0 {
            return Some(Duration::ZERO);
        }
        let per_unit = self.milli_per_interval(percent);
        if per_unit == 0 {
            return None;
        }
        let interval_ms = self.settings.refill.per.as_millis();
        let wait_ms = deficit.saturating_mul(interval_ms).div_ceil(per_unit);
        Some(Duration::from_millis(to_u64(wait_ms)))
    }

    fn refill(&mut self, now: DateTime<Utc>, percent: u8) {
        let capacity = self.capacity_milli(percent);
        if self.level_milli >= capacity {
            self.level_milli = capacity;
            self.last_refill = now;
            return;
        }

        let interval_ms = self.settings.refill.per.as_millis();
        let elapsed_ms = elapsed_between(self.last_refill, now).as_millis();
        let added = if interval_ms == 0 {
            capacity
        } else {
            elapsed_ms
                .saturating_mul(self.milli_per_interval(percent))
                .checked_div(interval_ms)
                .unwrap_or(0)
        };

        // Sub-millitoken progress is kept by not moving the refill mark.
        if added > 0 {
            self.level_milli = self.level_milli.saturating_add(added).min(capacity);
            self.last_refill = now;
        }
    }

    fn capacity_milli(&self, percent: u8) -> u128 {
        let full = u128::from(self.settings.capacity).saturating_mul(MILLI);
        let scaled = full
            .saturating_mul(u128::from(percent))
            .checked_div(PERCENT)
            .unwrap_or(0);
        if self.settings.capacity > 0 {
            scaled.max(MILLI)
        } else {
            0
        }
    }

    fn milli_per_interval(&self, percent: u8) -> u128 {
        u128::from(self.settings.refill.tokens)
            .saturating_mul(MILLI)
            .saturating_mul(u128::from(percent))
            .checked_div(PERCENT)
            .unwrap_or(0)
    }
}

fn to_u64(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
