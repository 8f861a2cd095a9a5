//! Verification gate behaviour in an assembled runtime.

use std::sync::Arc;

use rstest::rstest;
use serde_json::{Value, json};
use switchyard::events::CoreEvent;
use switchyard::message::domain::{AgentId, GroupId, Message};
use switchyard::verification::GateError;
use switchyard::verification::services::{GATE_AGENT_ID, REJECTION_FLAG_KEY};

use super::helpers::{Harness, Inbox, roomy_config, text_of};

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn rejected_step_is_withheld_and_the_sender_is_told() {
    let harness = Harness::start(roomy_config()).await;
    let planner = harness.inbox("planner").await;
    let coder = harness.inbox("coder").await;
    let leaked = harness.step("coder", "wf-secret", "use token=abc123 <script>");

    let result = harness.runtime.gate().submit(leaked.clone()).await;
    harness.settle().await;

    assert!(matches!(result, Err(GateError::Rejected(_))));
    assert!(coder.received().is_empty());
    let notices = planner.received();
    assert_eq!(notices.len(), 1);
    let notice = notices.first().expect("one notice");
    assert_eq!(notice.sender().as_str(), GATE_AGENT_ID);
    assert_eq!(notice.metadata().get(REJECTION_FLAG_KEY), Some(&Value::Bool(true)));
    assert!(!text_of(notice).contains("abc123"));
    assert_eq!(
        harness
            .events
            .count(|event| matches!(event, CoreEvent::VerificationRejected { .. })),
        1
    );
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn unlisted_sender_is_refused_by_permission() {
    let harness = Harness::start(roomy_config()).await;
    let coder = harness.inbox("coder").await;
    let intrusion = harness.text("intruder", "coder", "let me in");

    let result = harness.runtime.gate().submit(intrusion).await;
    harness.settle().await;

    let Err(GateError::Rejected(rejection)) = result else {
        panic!("expected rejection, got {result:?}");
    };
    assert_eq!(rejection.rule, "permission");
    assert!(coder.received().is_empty());
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn accepted_payload_is_scrubbed_before_delivery() {
    let harness = Harness::start(roomy_config()).await;
    let coder = harness.inbox("coder").await;
    let message = Message::builder("planner", "coder")
        .with_json(json!({
            "text": "deploy",
            "env": { "api_key": "k-123", "region": "eu" },
        }))
        .build(&harness.clock)
        .expect("valid message");

    harness
        .runtime
        .gate()
        .submit(message.clone())
        .await
        .expect("message accepted");
    harness.settle().await;

    let received = coder.received();
    let delivered = received.first().expect("one delivery");
    assert_eq!(delivered.id(), message.id());
    assert_eq!(
        delivered.payload(),
        &json!({ "text": "deploy", "env": { "region": "eu" } })
    );
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn group_submission_is_verified_once_and_fanned_out() {
    let harness = Harness::start(roomy_config()).await;
    let _planner = harness.inbox("planner").await;
    let coder = harness.inbox("coder").await;
    let reviewer = harness.inbox("reviewer").await;
    let team = GroupId::from("team");
    harness
        .runtime
        .bus()
        .create_group(
            team.clone(),
            vec![
                AgentId::from("planner"),
                AgentId::from("coder"),
                AgentId::from("reviewer"),
            ],
        )
        .expect("group created");

    let sent = harness
        .runtime
        .gate()
        .submit_to_group(harness.text("planner", "team", "standup"), &team)
        .await
        .expect("group message accepted");
    harness.settle().await;

    assert_eq!(sent.len(), 2);
    assert_eq!(coder.texts(), vec!["standup"]);
    assert_eq!(reviewer.texts(), vec!["standup"]);
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn guarded_recipient_never_sees_inbound_rejections() {
    let harness = Harness::start(roomy_config()).await;
    let coder = Inbox::default();
    harness
        .runtime
        .bus()
        .register_recipient("coder", harness.runtime.gate().guard(Arc::new(coder.clone())))
        .await
        .expect("registration succeeds");

    for text in ["fine", "<script>alert(1)</script>"] {
        harness
            .runtime
            .bus()
            .send(harness.text("planner", "coder", text))
            .await
            .expect("send bypasses the gate");
    }
    harness.settle().await;

    assert_eq!(coder.texts(), vec!["fine"]);
    assert_eq!(harness.port.acked().len(), 2);
    harness.runtime.shutdown().await.expect("shutdown succeeds");
}
