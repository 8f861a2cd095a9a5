//! Circuit breaking and rate limiting seen through the gate.

use std::time::Duration;

use rstest::rstest;
use switchyard::broker::domain::CircuitPhase;
use switchyard::broker::error::BrokerError;
use switchyard::broker::ports::TransportError;
use switchyard::config::ResourceLimitConfig;
use switchyard::delivery::BusError;
use switchyard::events::CoreEvent;
use switchyard::verification::GateError;

use super::helpers::{Harness, roomy_config};

fn broker_error(result: Result<impl std::fmt::Debug, GateError>) -> BrokerError {
    match result {
        Err(GateError::Bus(BusError::Broker(err))) => err,
        other => panic!("expected a broker error, got {other:?}"),
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn failing_broker_opens_the_circuit_then_recovers() {
    let mut config = roomy_config();
    config.broker.failure_threshold = 2;
    config.broker.publish_attempts = 1;
    config.broker.recovery_timeout_ms = 5_000;
    let harness = Harness::start(config).await;
    let coder = harness.inbox("coder").await;
    harness
        .port
        .fail_all_publishes(Some(TransportError::Transient("broker down".to_owned())));

    for text in ["one", "two"] {
        let err = broker_error(
            harness
                .runtime
                .gate()
                .submit(harness.text("planner", "coder", text))
                .await,
        );
        assert!(matches!(err, BrokerError::TransportExhausted { attempts: 1, .. }));
    }
    assert_eq!(harness.runtime.broker().circuit_phase(), CircuitPhase::Open);
    assert_eq!(harness.dead_letters.len(), 2);

    let publishes = harness.port.calls().publish;
    let err = broker_error(
        harness
            .runtime
            .gate()
            .submit(harness.text("planner", "coder", "three"))
            .await,
    );
    assert!(matches!(err, BrokerError::CircuitOpen { .. }));
    assert_eq!(harness.port.calls().publish, publishes);

    harness.port.fail_all_publishes(None);
    harness.clock.advance(Duration::from_secs(6));
    harness
        .runtime
        .gate()
        .submit(harness.text("planner", "coder", "four"))
        .await
        .expect("probe succeeds");
    harness.settle().await;

    assert_eq!(harness.runtime.broker().circuit_phase(), CircuitPhase::Closed);
    assert_eq!(coder.texts(), vec!["four"]);
    let phases: Vec<_> = harness
        .events
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
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn publish_budget_is_enforced_and_refills() {
    let mut config = roomy_config();
    config.rate_limits.resources.insert(
        config.broker.name.clone(),
        ResourceLimitConfig {
            capacity: 2,
            refill_tokens: 1,
            refill_period_ms: 10_000,
            ..ResourceLimitConfig::default()
        },
    );
    let harness = Harness::start(config).await;
    let coder = harness.inbox("coder").await;

    for text in ["a", "b"] {
        harness
            .runtime
            .gate()
            .submit(harness.text("planner", "coder", text))
            .await
            .expect("within budget");
    }
    let err = broker_error(
        harness
            .runtime
            .gate()
            .submit(harness.text("planner", "coder", "c"))
            .await,
    );
    assert!(matches!(err, BrokerError::RateLimited { .. }));
    assert_eq!(
        harness
            .events
            .count(|event| matches!(event, CoreEvent::RateLimitDenied { .. })),
        1
    );

    harness.clock.advance(Duration::from_secs(10));
    harness
        .runtime
        .gate()
        .submit(harness.text("planner", "coder", "d"))
        .await
        .expect("refilled");
    harness.settle().await;

    let mut texts = coder.texts();
    texts.sort();
    assert_eq!(texts, vec!["a", "b", "d"]);
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}
