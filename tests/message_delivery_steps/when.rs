//! When steps for delivery scenarios.

use std::time::Duration;

use eyre::{WrapErr, eyre};
use rstest_bdd_macros::when;
use serde_json::json;
use switchyard::broker::domain::Delivery;
use switchyard::message::domain::{Message, SequenceNumber};

use super::world::{DeliveryWorld, list, run_async};

const WORKFLOW: &str = "wf-steps";

fn submit(world: &mut DeliveryWorld, message: Message) -> Result<(), eyre::Report> {
    let result = run_async(world.runtime()?.gate().submit(message));
    world.last_submission = Some(result);
    world.settle();
    Ok(())
}

#[when(r#""{sender}" submits the workflow steps "{steps}" to "{recipient}""#)]
fn submit_steps(
    world: &mut DeliveryWorld,
    sender: String,
    steps: String,
    recipient: String,
) -> Result<(), eyre::Report> {
    for step in list(&steps) {
        let message = Message::builder(sender.as_str(), recipient.as_str())
            .with_json(json!({ "text": step }))
            .with_workflow(WORKFLOW)
            .build(&world.clock)
            .wrap_err("build step")?;
        submit(world, message)?;
    }
    Ok(())
}

#[when(r#""{sender}" submits "{text}" to "{recipient}""#)]
fn submit_text(
    world: &mut DeliveryWorld,
    sender: String,
    text: String,
    recipient: String,
) -> Result<(), eyre::Report> {
    let message = Message::builder(sender.as_str(), recipient.as_str())
        .with_json(json!({ "text": text }))
        .build(&world.clock)
        .wrap_err("build message")?;
    submit(world, message)
}

#[when("the broker redelivers the last message")]
fn redeliver_last(world: &mut DeliveryWorld) -> Result<(), eyre::Report> {
    let delivery_id = world
        .last_submission
        .clone()
        .ok_or_else(|| eyre!("nothing submitted"))?
        .wrap_err("last submission failed")?;
    let (topic, message) = world
        .port
        .published()
        .into_iter()
        .last()
        .ok_or_else(|| eyre!("nothing published"))?;
    if !world
        .port
        .redeliver(&Delivery::first(delivery_id, topic, message))
    {
        return Err(eyre!("no subscriber for redelivery"));
    }
    world.settle();
    Ok(())
}

#[when(r#"messages numbered "{numbers}" are sent in workflow "{workflow}" to "{recipient}""#)]
fn send_numbered(
    world: &mut DeliveryWorld,
    numbers: String,
    workflow: String,
    recipient: String,
) -> Result<(), eyre::Report> {
    for number in list(&numbers) {
        let sequence: u64 = number.parse().wrap_err("parse sequence number")?;
        let message = Message::builder("planner", recipient.as_str())
            .with_json(json!({ "text": format!("step {sequence}") }))
            .with_workflow(workflow.as_str())
            .with_sequence(SequenceNumber::new(sequence))
            .build(&world.clock)
            .wrap_err("build numbered message")?;
        run_async(world.runtime()?.bus().send(message)).wrap_err("send numbered message")?;
    }
    world.settle();
    Ok(())
}

#[when("the hold timeout elapses")]
fn hold_timeout_elapses(world: &mut DeliveryWorld) -> Result<(), eyre::Report> {
    let hold = world.runtime()?.config().delivery.hold_timeout_ms;
    world
        .clock
        .advance(Duration::from_millis(hold.saturating_add(1)));
    run_async(world.runtime()?.bus().flush_expired());
    world.settle();
    Ok(())
}
