//! Parsing, defaults and validation of the configuration document.

use std::time::Duration;

use camino::Utf8PathBuf;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use rstest::rstest;
use uuid::Uuid;

use super::{ConfigError, CoreConfig};
use crate::broker::services::{BrokerSettings, JitterPolicy};
use crate::delivery::BusSettings;
use crate::rate_limit::HealthThresholds;
use crate::sequencing::SequenceSettings;
use crate::verification::VerificationSettings;
use crate::verification::services::ValidatorKind;

#[rstest]
fn empty_document_yields_component_defaults() {
    let config = CoreConfig::from_json_str("{}").expect("defaults are valid");

    assert_eq!(config, CoreConfig::default());
    assert_eq!(config.broker.settings(), BrokerSettings::default());
    assert_eq!(config.delivery.sequencing(), SequenceSettings::default());
    assert_eq!(config.delivery.bus(), BusSettings::default());
    assert_eq!(config.verification.rules, VerificationSettings::default());
    assert_eq!(
        config.rate_limits.default.health.thresholds(),
        HealthThresholds::default()
    );
}

#[rstest]
fn millisecond_fields_become_durations() {
    let config = CoreConfig::from_json_str(
        r#"{
            "broker": {
                "name": "events",
                "recovery_timeout_ms": 1500,
                "publish_backoff": { "first_ms": 10, "max_ms": 40, "jitter": "none" }
            },
            "delivery": { "hold_timeout_ms": 250, "topic_prefix": "team" },
            "verification": {
                "validators": [{ "type": "integrity" }],
                "rejection_template": "no: {{ reason }}"
            },
            "rate_limits": {
                "resources": { "events": { "capacity": 3, "refill_tokens": 3, "refill_period_ms": 500 } }
            }
        }"#,
    )
    .expect("valid configuration");

    let broker = config.broker.settings();
    assert_eq!(broker.name, "events");
    assert_eq!(broker.circuit.recovery_timeout, Duration::from_millis(1500));
    assert_eq!(broker.publish_backoff.first, Duration::from_millis(10));
    assert_eq!(broker.publish_backoff.jitter, JitterPolicy::None);
    assert_eq!(config.delivery.sequencing().hold_timeout, Duration::from_millis(250));
    assert_eq!(config.delivery.bus().topic_prefix, "team");
    assert!(matches!(
        config.verification.rules.validators.as_slice(),
        [spec] if spec.kind == ValidatorKind::Integrity
    ));
    assert!(config.verification.rules.sanitizers.is_empty());
    assert_eq!(config.verification.rejection_template, "no: {{ reason }}");
    let bucket = config
        .rate_limits
        .resources
        .get("events")
        .map(|limit| limit.bucket())
        .expect("events limit");
    assert_eq!(bucket.capacity, 3);
    assert_eq!(bucket.refill.per, Duration::from_millis(500));
}

#[rstest]
#[case(r#"{"broker": {"publish_attempts": 0}}"#, "broker.publish_attempts")]
#[case(r#"{"broker": {"name": "  "}}"#, "broker.name")]
#[case(r#"{"delivery": {"hold_timeout_ms": 0}}"#, "delivery.hold_timeout_ms")]
#[case(
    r#"{"delivery": {"hold_timeout_ms": 5000, "idle_timeout_ms": 10}}"#,
    "delivery.idle_timeout_ms"
)]
#[case(
    r#"{"rate_limits": {"resources": {"llm": {"capacity": 0}}}}"#,
    "rate_limits.resources.llm.capacity"
)]
#[case(
    r#"{"rate_limits": {"default": {"health": {"degraded_percent": 120}}}}"#,
    "rate_limits.default.health.degraded_percent"
)]
fn out_of_range_values_are_named(#[case] json: &str, #[case] expected_field: &str) {
    let error = CoreConfig::from_json_str(json).expect_err("must be invalid");

    assert!(
        matches!(&error, ConfigError::Invalid { field, .. } if field == expected_field),
        "unexpected error {error:?}"
    );
}

#[rstest]
fn malformed_json_is_a_parse_error() {
    assert!(matches!(
        CoreConfig::from_json_str(r#"{"broker": {"name": 7}}"#),
        Err(ConfigError::Parse(_))
    ));
}

#[rstest]
fn configuration_loads_from_a_file() {
    let temp = Utf8PathBuf::from_path_buf(std::env::temp_dir()).expect("utf-8 temp dir");
    let file_name = format!("switchyard-{}.json", Uuid::new_v4());
    let dir = Dir::open_ambient_dir(&temp, ambient_authority()).expect("temp dir opens");
    dir.write(&file_name, r#"{"delivery": {"max_held": 7}}"#)
        .expect("config written");

    let loaded = CoreConfig::from_path(&temp.join(&file_name));
    dir.remove_file(&file_name).expect("config removed");

    assert_eq!(loaded.expect("config loads").delivery.max_held, 7);
    assert!(matches!(
        CoreConfig::from_path(&temp.join("missing-switchyard.json")),
        Err(ConfigError::Read { .. })
    ));
}
