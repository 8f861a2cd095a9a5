//! Runtime configuration.
//!
//! [`CoreConfig`] is a JSON document with four sections, each mapped onto
//! the settings of the component it configures:
//!
//! ```json
//! {
//!   "broker": { "name": "primary", "failure_threshold": 5 },
//!   "delivery": { "hold_timeout_ms": 30000, "topic_prefix": "agents" },
//!   "verification": { "validators": [{ "type": "schema" }], "sanitizers": [] },
//!   "rate_limits": { "resources": { "primary": { "capacity": 100 } } }
//! }
//! ```

mod error;
mod sections;

use camino::Utf8Path;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use error::ConfigError;
pub use sections::{
    BackoffConfig, BrokerConfig, DeliveryConfig, HealthConfig, RateLimitConfig,
    ResourceLimitConfig, VerificationConfig,
};

/// Complete configuration of a switchyard runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Broker adapter.
    pub broker: BrokerConfig,
    /// Delivery bus, dedup and sequencing.
    pub delivery: DeliveryConfig,
    /// Verification rules.
    pub verification: VerificationConfig,
    /// Rate limits.
    pub rate_limits: RateLimitConfig,
}

impl CoreConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON or
    /// [`ConfigError::Invalid`] for out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise
    /// as [`Self::from_json_str`].
    pub fn from_path(path: &Utf8Path) -> Result<Self, ConfigError> {
        let read_error = |source| ConfigError::Read {
            path: path.to_owned(),
            source,
        };
        let file_name = path.file_name().ok_or_else(|| {
            read_error(std::io::Error::other("path must include a file name"))
        })?;
        let parent = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or_else(|| Utf8Path::new("."));
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(read_error)?;
        let contents = dir.read_to_string(file_name).map_err(read_error)?;
        debug!(path = %path, "configuration loaded");
        Self::from_json_str(&contents)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let broker = &self.broker;
        if broker.name.trim().is_empty() {
            return Err(ConfigError::invalid("broker.name", "must not be blank"));
        }
        for (field, value) in [
            ("broker.failure_threshold", broker.failure_threshold),
            ("broker.publish_attempts", broker.publish_attempts),
            ("broker.reconnect_attempts", broker.reconnect_attempts),
            ("broker.max_delivery_attempts", broker.max_delivery_attempts),
            ("broker.publish_backoff.factor", broker.publish_backoff.factor),
            ("broker.reconnect_backoff.factor", broker.reconnect_backoff.factor),
        ] {
            require(field, u64::from(value))?;
        }
        for (field, backoff) in [
            ("broker.publish_backoff", broker.publish_backoff),
            ("broker.reconnect_backoff", broker.reconnect_backoff),
        ] {
            if backoff.first_ms > backoff.max_ms {
                return Err(ConfigError::invalid(field, "first_ms exceeds max_ms"));
            }
        }

        let delivery = &self.delivery;
        for (field, value) in [
            ("delivery.dedup_ttl_ms", delivery.dedup_ttl_ms),
            ("delivery.hold_timeout_ms", delivery.hold_timeout_ms),
            ("delivery.idle_timeout_ms", delivery.idle_timeout_ms),
            ("delivery.sweep_interval_ms", delivery.sweep_interval_ms),
        ] {
            require(field, value)?;
        }
        require("delivery.max_held", u64::try_from(delivery.max_held).unwrap_or(u64::MAX))?;
        if delivery.idle_timeout_ms < delivery.hold_timeout_ms {
            return Err(ConfigError::invalid(
                "delivery.idle_timeout_ms",
                "must not be shorter than hold_timeout_ms",
            ));
        }
        if delivery.topic_prefix.trim().is_empty() {
            return Err(ConfigError::invalid("delivery.topic_prefix", "must not be blank"));
        }

        validate_limit("rate_limits.default", &self.rate_limits.default)?;
        for (resource, limit) in &self.rate_limits.resources {
            validate_limit(&format!("rate_limits.resources.{resource}"), limit)?;
        }
        Ok(())
    }
}

fn require(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(field, "must be greater than zero"));
    }
    Ok(())
}

fn validate_limit(prefix: &str, limit: &ResourceLimitConfig) -> Result<(), ConfigError> {
    require(&format!("{prefix}.capacity"), limit.capacity)?;
    require(&format!("{prefix}.refill_tokens"), limit.refill_tokens)?;
    require(&format!("{prefix}.refill_period_ms"), limit.refill_period_ms)?;
    let health = &limit.health;
    if health.degraded_error_permille > health.critical_error_permille
        || health.critical_error_permille > 1_000
    {
        return Err(ConfigError::invalid(
            format!("{prefix}.health"),
            "error thresholds must satisfy degraded <= critical <= 1000",
        ));
    }
    if health.degraded_latency_ms > health.critical_latency_ms {
        return Err(ConfigError::invalid(
            format!("{prefix}.health"),
            "degraded_latency_ms exceeds critical_latency_ms",
        ));
    }
    for (name, percent) in [
        ("recovery_step_percent", health.recovery_step_percent),
        ("degraded_percent", health.degraded_percent),
        ("critical_percent", health.critical_percent),
    ] {
        if percent == 0 || percent > 100 {
            return Err(ConfigError::invalid(
                format!("{prefix}.health.{name}"),
                "must be between 1 and 100",
            ));
        }
    }
    if health.window == 0 || health.min_samples > health.window {
        return Err(ConfigError::invalid(
            format!("{prefix}.health.window"),
            "must be non-zero and hold at least min_samples",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
