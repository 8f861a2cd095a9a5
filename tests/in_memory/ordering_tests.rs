//! Workflow ordering through an assembled runtime.

use std::time::Duration;

use rstest::rstest;
use switchyard::events::CoreEvent;
use switchyard::message::domain::{AgentId, SequenceNumber, WorkflowId};

use super::helpers::{Harness, roomy_config};

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn workflow_steps_arrive_numbered_and_in_order() {
    let harness = Harness::start(roomy_config()).await;
    let coder = harness.inbox("coder").await;

    for text in ["design", "implement", "test", "review"] {
        harness
            .runtime
            .gate()
            .submit(harness.step("coder", "wf-order", text))
            .await
            .expect("step accepted");
    }
    harness.settle().await;

    assert_eq!(coder.texts(), vec!["design", "implement", "test", "review"]);
    assert_eq!(coder.sequences(), vec![1, 2, 3, 4]);
    assert!(harness.runtime.bus().pending().is_empty());
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn independent_workflows_are_numbered_separately() {
    let harness = Harness::start(roomy_config()).await;
    let coder = harness.inbox("coder").await;

    for workflow in ["wf-a", "wf-b", "wf-a"] {
        harness
            .runtime
            .bus()
            .send(harness.step("coder", workflow, workflow))
            .await
            .expect("send succeeds");
    }
    harness.settle().await;

    let mut numbered: Vec<_> = coder
        .received()
        .iter()
        .filter_map(|message| {
            let workflow = message.workflow_id()?.as_str().to_owned();
            Some((workflow, message.sequence()?.value()))
        })
        .collect();
    numbered.sort();
    assert_eq!(
        numbered,
        vec![
            ("wf-a".to_owned(), 1),
            ("wf-a".to_owned(), 2),
            ("wf-b".to_owned(), 1)
        ]
    );
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn out_of_order_arrivals_are_held_until_the_gap_fills() {
    let harness = Harness::start(roomy_config()).await;
    let coder = harness.inbox("coder").await;

    for sequence in [2, 3] {
        harness
            .runtime
            .bus()
            .send(harness.numbered("coder", "wf-hold", sequence))
            .await
            .expect("send succeeds");
    }
    harness.settle().await;
    assert!(coder.sequences().is_empty());
    assert_eq!(harness.runtime.bus().pending().len(), 2);

    harness
        .runtime
        .bus()
        .send(harness.numbered("coder", "wf-hold", 1))
        .await
        .expect("send succeeds");
    harness.settle().await;

    assert_eq!(coder.sequences(), vec![1, 2, 3]);
    assert!(harness.runtime.bus().pending().is_empty());
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn gap_that_never_fills_is_skipped_after_the_hold_timeout() {
    let harness = Harness::start(roomy_config()).await;
    let coder = harness.inbox("coder").await;

    for sequence in [1, 2, 4, 5] {
        harness
            .runtime
            .bus()
            .send(harness.numbered("coder", "wf-gap", sequence))
            .await
            .expect("send succeeds");
    }
    harness.settle().await;
    assert_eq!(coder.sequences(), vec![1, 2]);

    harness.clock.advance(Duration::from_secs(31));
    harness.runtime.bus().flush_expired().await;
    harness.settle().await;

    assert_eq!(coder.sequences(), vec![1, 2, 4, 5]);
    assert!(harness.events.events().contains(&CoreEvent::SequenceGapSkipped {
        workflow_id: WorkflowId::from("wf-gap"),
        recipient: AgentId::from("coder"),
        missing: vec![SequenceNumber::new(3)],
    }));

    harness
        .runtime
        .bus()
        .send(harness.numbered("coder", "wf-gap", 3))
        .await
        .expect("send succeeds");
    harness.settle().await;

    assert_eq!(coder.sequences(), vec![1, 2, 4, 5]);
    assert_eq!(
        harness
            .events
            .count(|event| matches!(event, CoreEvent::StaleDropped { .. })),
        1
    );
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}
