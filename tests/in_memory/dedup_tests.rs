//! Redelivery after a lost acknowledgement.

use rstest::rstest;
use switchyard::broker::domain::Delivery;
use switchyard::events::CoreEvent;
use switchyard::message::domain::{AgentId, WorkflowId};
use switchyard::sequencing::StreamKey;

use super::helpers::{Harness, roomy_config};

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn redelivered_workflow_step_is_processed_once() {
    let harness = Harness::start(roomy_config()).await;
    let coder = harness.inbox("coder").await;

    let delivery_id = harness
        .runtime
        .gate()
        .submit(harness.step("coder", "wf-dup", "build"))
        .await
        .expect("step accepted");
    harness.settle().await;

    let (topic, published) = harness
        .port
        .published()
        .into_iter()
        .last()
        .expect("one publish");
    assert_eq!(topic, harness.runtime.bus().topic_for(&AgentId::from("coder")));
    assert!(
        harness
            .port
            .redeliver(&Delivery::first(delivery_id, topic, published))
    );
    harness.settle().await;

    assert_eq!(coder.texts(), vec!["build"]);
    assert_eq!(
        harness
            .events
            .count(|event| matches!(event, CoreEvent::DuplicateDropped { .. })),
        1
    );
    assert_eq!(harness.port.acked().len(), 2);
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn resending_the_same_message_id_is_dropped() {
    let harness = Harness::start(roomy_config()).await;
    let coder = harness.inbox("coder").await;
    let message = harness.text("planner", "coder", "once");

    for _ in 0..2 {
        harness
            .runtime
            .bus()
            .send(message.clone())
            .await
            .expect("send succeeds");
    }
    harness.settle().await;

    assert_eq!(coder.texts(), vec!["once"]);
    assert!(harness.runtime.bus().dedup().contains(message.id()));
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn resent_workflow_step_does_not_stall_its_stream() {
    let harness = Harness::start(roomy_config()).await;
    let coder = harness.inbox("coder").await;
    let first = harness.step("coder", "w1", "first");

    for _ in 0..2 {
        harness
            .runtime
            .bus()
            .send(first.clone())
            .await
            .expect("send succeeds");
    }
    harness
        .runtime
        .bus()
        .send(harness.step("coder", "w1", "second"))
        .await
        .expect("send succeeds");
    harness.settle().await;

    assert_eq!(coder.texts(), vec!["first", "second"]);
    assert_eq!(coder.sequences(), vec![1, 2]);
    let state = harness
        .runtime
        .bus()
        .tracker()
        .state(&StreamKey::new(WorkflowId::from("w1"), AgentId::from("coder")))
        .expect("stream state");
    assert!(state.held().is_empty());
    assert!(state.missing().is_empty());
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}
