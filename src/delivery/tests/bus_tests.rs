//! Routing, ordering and settlement through the delivery bus.

use std::sync::Arc;
use std::time::Duration;

use rstest::rstest;

use super::fixtures::{Agent, BusHarness};
use crate::broker::domain::Delivery;
use crate::delivery::{AckOutcome, BusError};
use crate::events::CoreEvent;
use crate::message::domain::{AgentId, SequenceNumber, WorkflowId};
use crate::sequencing::StreamKey;

fn sequences(agent: &Agent) -> Vec<u64> {
    agent
        .received()
        .iter()
        .filter_map(|message| message.sequence().map(|sequence| sequence.value()))
        .collect()
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn workflow_messages_arrive_in_send_order() {
    let harness = BusHarness::start().await;
    let coder = harness.agent("coder").await;

    for text in ["design", "implement", "review"] {
        harness
            .bus
            .send(harness.step("planner", "coder", "wf-1", text))
            .await
            .expect("send succeeds");
    }
    harness.settle().await;

    assert_eq!(coder.texts(), vec!["design", "implement", "review"]);
    assert_eq!(sequences(&coder), vec![1, 2, 3]);
    assert!(harness.bus.pending().is_empty());
    assert_eq!(harness.port.acked().len(), 3);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn early_arrival_waits_for_the_gap() {
    let harness = BusHarness::start().await;
    let coder = harness.agent("coder").await;

    for sequence in [1, 3, 2] {
        harness
            .bus
            .send(harness.numbered("coder", "wf-2", sequence))
            .await
            .expect("send succeeds");
    }
    harness.settle().await;

    assert_eq!(sequences(&coder), vec![1, 2, 3]);
    assert_eq!(
        harness
            .events
            .count(|event| matches!(event, CoreEvent::SequenceGapSkipped { .. })),
        0
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn timed_out_gap_is_skipped_and_late_arrival_dropped() {
    let harness = BusHarness::start().await;
    let coder = harness.agent("coder").await;

    for sequence in [1, 3] {
        harness
            .bus
            .send(harness.numbered("coder", "wf-3", sequence))
            .await
            .expect("send succeeds");
    }
    harness.settle().await;
    assert_eq!(sequences(&coder), vec![1]);

    harness.clock.advance(Duration::from_secs(31));
    let released = harness.bus.flush_expired().await;

    assert_eq!(released, 1);
    assert_eq!(sequences(&coder), vec![1, 3]);
    assert!(harness.events.events().contains(&CoreEvent::SequenceGapSkipped {
        workflow_id: WorkflowId::from("wf-3"),
        recipient: AgentId::from("coder"),
        missing: vec![SequenceNumber::new(2)],
    }));

    harness
        .bus
        .send(harness.numbered("coder", "wf-3", 2))
        .await
        .expect("send succeeds");
    harness.settle().await;

    assert_eq!(sequences(&coder), vec![1, 3]);
    assert_eq!(
        harness
            .events
            .count(|event| matches!(event, CoreEvent::StaleDropped { .. })),
        1
    );
    assert!(harness.bus.pending().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn failed_handler_gets_the_message_again_in_order() {
    let harness = BusHarness::start().await;
    let coder = harness.agent("coder").await;
    coder.fail_on("implement", 1);

    for text in ["design", "implement", "review"] {
        harness
            .bus
            .send(harness.step("planner", "coder", "wf-4", text))
            .await
            .expect("send succeeds");
    }
    harness.settle().await;

    assert_eq!(coder.texts(), vec!["design", "implement", "review"]);
    assert_eq!(
        harness.events.count(|event| matches!(
            event,
            CoreEvent::Nacked {
                requeued: true,
                ..
            }
        )),
        1
    );
    assert!(harness.dead_letters.is_empty());
    assert!(harness.bus.pending().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn dead_lettered_message_does_not_block_its_stream() {
    let harness = BusHarness::start().await;
    let coder = harness.agent("coder").await;
    coder.fail_on("implement", 10);

    for text in ["design", "implement", "review"] {
        harness
            .bus
            .send(harness.step("planner", "coder", "wf-5", text))
            .await
            .expect("send succeeds");
    }
    harness.settle().await;

    assert_eq!(coder.texts(), vec!["design", "review"]);
    let dead = harness.dead_letters.entries();
    assert_eq!(dead.len(), 1);
    assert_eq!(
        dead.first().map(|entry| entry.reason.as_str()),
        Some("cannot process implement")
    );
    let state = harness
        .bus
        .tracker()
        .state(&StreamKey::new(WorkflowId::from("wf-5"), AgentId::from("coder")))
        .expect("stream state");
    assert_eq!(state.missing(), vec![SequenceNumber::new(2)]);
    assert!(harness.bus.pending().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn redelivered_message_is_processed_once() {
    let harness = BusHarness::start().await;
    let coder = harness.agent("coder").await;
    let message = harness.text("planner", "coder", "hello");

    let delivery_id = harness
        .bus
        .send(message.clone())
        .await
        .expect("send succeeds");
    harness.settle().await;

    let topic = harness.bus.topic_for(&AgentId::from("coder"));
    assert!(
        harness
            .port
            .redeliver(&Delivery::first(delivery_id, topic, message))
    );
    harness.settle().await;

    assert_eq!(coder.texts(), vec!["hello"]);
    assert_eq!(
        harness
            .events
            .count(|event| matches!(event, CoreEvent::DuplicateDropped { .. })),
        1
    );
    assert_eq!(harness.port.acked().len(), 2);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn replies_are_routed_back_to_the_sender() {
    let harness = BusHarness::start().await;
    let planner = harness.agent("planner").await;
    let coder = Agent::new("coder", harness.clock.clone()).replying();
    harness
        .bus
        .register_recipient("coder", Arc::new(coder.clone()))
        .await
        .expect("registration succeeds");

    harness
        .bus
        .send(harness.text("planner", "coder", "ping"))
        .await
        .expect("send succeeds");
    harness.settle().await;

    assert_eq!(coder.texts(), vec!["ping"]);
    assert_eq!(planner.texts(), vec!["re: ping"]);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn messages_wait_for_late_registration() {
    let harness = BusHarness::start().await;

    harness
        .bus
        .send(harness.text("planner", "tester", "queued"))
        .await
        .expect("send succeeds");
    let pending = harness.bus.pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending.first().map(|record| record.outcome),
        Some(AckOutcome::Pending)
    );

    let tester = harness.agent("tester").await;
    harness.settle().await;

    assert_eq!(tester.texts(), vec!["queued"]);
    assert!(harness.bus.pending().is_empty());
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn reregistering_replaces_the_handler() {
    let harness = BusHarness::start().await;
    let first = harness.agent("coder").await;
    let second = harness.agent("coder").await;

    harness
        .bus
        .send(harness.text("planner", "coder", "hello"))
        .await
        .expect("send succeeds");
    harness.settle().await;

    assert!(first.texts().is_empty());
    assert_eq!(second.texts(), vec!["hello"]);
    assert_eq!(harness.port.subscription_count(), 1);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn unregistering_removes_the_subscription() {
    let harness = BusHarness::start().await;
    let _coder = harness.agent("coder").await;
    let coder_id = AgentId::from("coder");

    harness
        .bus
        .unregister_recipient(&coder_id)
        .await
        .expect("unregister succeeds");

    assert_eq!(harness.port.subscription_count(), 0);
    assert!(harness.bus.recipients().is_empty());
    assert_eq!(
        harness.bus.unregister_recipient(&coder_id).await,
        Err(BusError::UnknownRecipient(coder_id))
    );
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn sweeper_releases_timed_out_gaps() {
    let harness = BusHarness::start().await;
    let coder = harness.agent("coder").await;
    for sequence in [1, 3] {
        harness
            .bus
            .send(harness.numbered("coder", "wf-6", sequence))
            .await
            .expect("send succeeds");
    }
    harness.settle().await;

    harness.bus.spawn_sweeper(Arc::new(harness.clock.clone()));
    for _ in 0..5_000 {
        if sequences(&coder).len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    harness.bus.close().await.expect("close succeeds");

    assert_eq!(sequences(&coder), vec![1, 3]);
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn closed_bus_refuses_to_send() {
    let harness = BusHarness::start().await;
    harness.bus.close().await.expect("close succeeds");

    let result = harness
        .bus
        .send(harness.text("planner", "coder", "late"))
        .await;

    assert_eq!(result, Err(BusError::Closed));
}
