//! Configuration sections and their mapping onto component settings.
//!
//! Durations are expressed in milliseconds. Every field has a default, so
//! a section may be omitted or given partially.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::broker::domain::{CircuitSettings, DEFAULT_DEAD_LETTER_PREFIX};
use crate::broker::services::{BackoffPolicy, BrokerSettings, JitterPolicy};
use crate::delivery::{BusSettings, DEFAULT_SWEEP_INTERVAL, DEFAULT_TOPIC_PREFIX};
use crate::rate_limit::{BucketSettings, HealthThresholds, RefillRate};
use crate::sequencing::{
    DEFAULT_DEDUP_TTL, DEFAULT_HOLD_TIMEOUT, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_HELD,
    SequenceSettings,
};
use crate::verification::VerificationSettings;
use crate::verification::services::DEFAULT_REJECTION_TEMPLATE;

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Exponential backoff, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub first_ms: u64,
    /// Upper bound on any delay.
    pub max_ms: u64,
    /// Growth per attempt.
    pub factor: u32,
    /// Randomisation.
    pub jitter: JitterPolicy,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::from(BackoffPolicy::default())
    }
}

impl From<BackoffPolicy> for BackoffConfig {
    fn from(policy: BackoffPolicy) -> Self {
        Self {
            first_ms: millis(policy.first),
            max_ms: millis(policy.max),
            factor: policy.factor,
            jitter: policy.jitter,
        }
    }
}

impl BackoffConfig {
    /// Returns the policy.
    #[must_use]
    pub const fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(self.first_ms),
            max: Duration::from_millis(self.max_ms),
            factor: self.factor,
            jitter: self.jitter,
        }
    }
}

/// The `broker` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Connection name; also the rate-limit resource of publishes.
    pub name: String,
    /// Adapter-specific connection parameters, passed through untouched.
    pub connection: Map<String, Value>,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe.
    pub recovery_timeout_ms: u64,
    /// Publish attempts before dead-lettering.
    pub publish_attempts: u32,
    /// Delay between publish attempts.
    pub publish_backoff: BackoffConfig,
    /// Connection attempts per reconnection.
    pub reconnect_attempts: u32,
    /// Delay between connection attempts.
    pub reconnect_backoff: BackoffConfig,
    /// Delivery attempts before a rejected delivery is dead-lettered.
    pub max_delivery_attempts: u32,
    /// Prefix of dead-letter destinations.
    pub dead_letter_prefix: String,
    /// Take a rate-limit token per publish.
    pub rate_limited: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let settings = BrokerSettings::default();
        Self {
            name: settings.name,
            connection: Map::new(),
            failure_threshold: settings.circuit.failure_threshold,
            recovery_timeout_ms: millis(settings.circuit.recovery_timeout),
            publish_attempts: settings.publish_attempts,
            publish_backoff: settings.publish_backoff.into(),
            reconnect_attempts: settings.reconnect_attempts,
            reconnect_backoff: settings.reconnect_backoff.into(),
            max_delivery_attempts: settings.max_delivery_attempts,
            dead_letter_prefix: DEFAULT_DEAD_LETTER_PREFIX.to_owned(),
            rate_limited: settings.rate_limited,
        }
    }
}

impl BrokerConfig {
    /// Returns the resilient adapter settings.
    #[must_use]
    pub fn settings(&self) -> BrokerSettings {
        BrokerSettings {
            name: self.name.clone(),
            circuit: CircuitSettings {
                failure_threshold: self.failure_threshold,
                recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            },
            publish_attempts: self.publish_attempts,
            publish_backoff: self.publish_backoff.policy(),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_backoff: self.reconnect_backoff.policy(),
            max_delivery_attempts: self.max_delivery_attempts,
            dead_letter_prefix: self.dead_letter_prefix.clone(),
            rate_limited: self.rate_limited,
        }
    }
}

/// The `delivery` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Window in which a message id counts as a duplicate.
    pub dedup_ttl_ms: u64,
    /// How long an early message waits for its gap.
    pub hold_timeout_ms: u64,
    /// Inactivity after which stream state is collected.
    pub idle_timeout_ms: u64,
    /// Held messages per stream.
    pub max_held: usize,
    /// Period of the background sweeper.
    pub sweep_interval_ms: u64,
    /// Prefix of recipient topics.
    pub topic_prefix: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            dedup_ttl_ms: millis(DEFAULT_DEDUP_TTL),
            hold_timeout_ms: millis(DEFAULT_HOLD_TIMEOUT),
            idle_timeout_ms: millis(DEFAULT_IDLE_TIMEOUT),
            max_held: DEFAULT_MAX_HELD,
            sweep_interval_ms: millis(DEFAULT_SWEEP_INTERVAL),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_owned(),
        }
    }
}

impl DeliveryConfig {
    /// Returns the dedup window.
    #[must_use]
    pub const fn dedup_ttl(&self) -> Duration {
        Duration::from_millis(self.dedup_ttl_ms)
    }

    /// Returns the sequence tracker settings.
    #[must_use]
    pub const fn sequencing(&self) -> SequenceSettings {
        SequenceSettings {
            hold_timeout: Duration::from_millis(self.hold_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            max_held: self.max_held,
        }
    }

    /// Returns the bus settings.
    #[must_use]
    pub fn bus(&self) -> BusSettings {
        BusSettings {
            topic_prefix: self.topic_prefix.clone(),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
        }
    }
}

/// The `verification` section: rule specs plus the notice template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Validators and sanitizers.
    #[serde(flatten)]
    pub rules: VerificationSettings,
    /// Template of rejection notices.
    pub rejection_template: String,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            rules: VerificationSettings::default(),
            rejection_template: DEFAULT_REJECTION_TEMPLATE.to_owned(),
        }
    }
}

/// Health thresholds, durations in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Error rate, in permille, counted as a degraded breach.
    pub degraded_error_permille: u32,
    /// Error rate, in permille, counted as a critical breach.
    pub critical_error_permille: u32,
    /// p95 latency counted as a degraded breach.
    pub degraded_latency_ms: u64,
    /// p95 latency counted as a critical breach.
    pub critical_latency_ms: u64,
    /// Samples required for a verdict.
    pub min_samples: usize,
    /// Samples kept in the rolling window.
    pub window: usize,
    /// Quiet time before recovery starts.
    pub cooldown_ms: u64,
    /// Clean time per recovery step.
    pub recovery_interval_ms: u64,
    /// Throughput restored per step, in percent.
    pub recovery_step_percent: u8,
    /// Throughput while degraded, in percent.
    pub degraded_percent: u8,
    /// Throughput while critical, in percent.
    pub critical_percent: u8,
}

impl Default for HealthConfig {
    fn default() -> Self {
        let thresholds = HealthThresholds::default();
        Self {
            degraded_error_permille: thresholds.degraded_error_permille,
            critical_error_permille: thresholds.critical_error_permille,
            degraded_latency_ms: millis(thresholds.degraded_latency),
            critical_latency_ms: millis(thresholds.critical_latency),
            min_samples: thresholds.min_samples,
            window: thresholds.window,
            cooldown_ms: millis(thresholds.cooldown),
            recovery_interval_ms: millis(thresholds.recovery_interval),
            recovery_step_percent: thresholds.recovery_step_percent,
            degraded_percent: thresholds.degraded_percent,
            critical_percent: thresholds.critical_percent,
        }
    }
}

impl HealthConfig {
    /// Returns the thresholds.
    #[must_use]
    pub const fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            degraded_error_permille: self.degraded_error_permille,
            critical_error_permille: self.critical_error_permille,
            degraded_latency: Duration::from_millis(self.degraded_latency_ms),
            critical_latency: Duration::from_millis(self.critical_latency_ms),
            min_samples: self.min_samples,
            window: self.window,
            cooldown: Duration::from_millis(self.cooldown_ms),
            recovery_interval: Duration::from_millis(self.recovery_interval_ms),
            recovery_step_percent: self.recovery_step_percent,
            degraded_percent: self.degraded_percent,
            critical_percent: self.critical_percent,
        }
    }
}

/// Bucket and health settings of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimitConfig {
    /// Maximum tokens.
    pub capacity: u64,
    /// Tokens added per refill period.
    pub refill_tokens: u64,
    /// Refill period.
    pub refill_period_ms: u64,
    /// Health thresholds.
    pub health: HealthConfig,
}

impl Default for ResourceLimitConfig {
    fn default() -> Self {
        let bucket = BucketSettings::default();
        Self {
            capacity: bucket.capacity,
            refill_tokens: bucket.refill.tokens,
            refill_period_ms: millis(bucket.refill.per),
            health: HealthConfig::default(),
        }
    }
}

impl ResourceLimitConfig {
    /// Returns the bucket settings.
    #[must_use]
    pub const fn bucket(&self) -> BucketSettings {
        BucketSettings {
            capacity: self.capacity,
            refill: RefillRate {
                tokens: self.refill_tokens,
                per: Duration::from_millis(self.refill_period_ms),
            },
        }
    }
}

/// The `rate_limits` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Settings of resources without an entry.
    pub default: ResourceLimitConfig,
    /// Per-resource settings.
    pub resources: BTreeMap<String, ResourceLimitConfig>,
}
