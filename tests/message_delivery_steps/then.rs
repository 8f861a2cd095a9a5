//! Then steps for delivery scenarios.

use eyre::{Result, eyre};
use rstest_bdd_macros::then;
use serde_json::Value;
use switchyard::broker::domain::CircuitPhase;
use switchyard::broker::error::BrokerError;
use switchyard::delivery::BusError;
use switchyard::events::CoreEvent;
use switchyard::message::domain::{AgentId, SequenceNumber, WorkflowId};
use switchyard::verification::GateError;
use switchyard::verification::services::REJECTION_FLAG_KEY;

use super::world::{DeliveryWorld, list};

fn last_error(world: &DeliveryWorld) -> Result<&GateError> {
    match &world.last_submission {
        Some(Err(err)) => Ok(err),
        Some(Ok(id)) => Err(eyre!("submission {id} succeeded")),
        None => Err(eyre!("nothing submitted")),
    }
}

#[then(r#""{agent}" receives "{texts}""#)]
fn receives_texts(world: &DeliveryWorld, agent: String, texts: String) -> Result<()> {
    assert_eq!(world.inbox(&agent)?.texts(), list(&texts));
    Ok(())
}

#[then(r#""{agent}" receives sequences "{numbers}""#)]
fn receives_sequences(world: &DeliveryWorld, agent: String, numbers: String) -> Result<()> {
    let expected = list(&numbers)
        .iter()
        .map(|number| number.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()?;
    assert_eq!(world.inbox(&agent)?.sequences(), expected);
    Ok(())
}

#[then(r#""{agent}" receives nothing"#)]
fn receives_nothing(world: &DeliveryWorld, agent: String) -> Result<()> {
    assert!(world.inbox(&agent)?.received().is_empty());
    Ok(())
}

#[then(r#""{agent}" receives a rejection notice"#)]
fn receives_notice(world: &DeliveryWorld, agent: String) -> Result<()> {
    let received = world.inbox(&agent)?.received();
    let notice = received
        .first()
        .ok_or_else(|| eyre!("{agent} received nothing"))?;
    assert_eq!(
        notice.metadata().get(REJECTION_FLAG_KEY),
        Some(&Value::Bool(true))
    );
    Ok(())
}

#[then("exactly one duplicate is dropped")]
fn one_duplicate(world: &DeliveryWorld) {
    assert_eq!(
        world
            .events
            .count(|event| matches!(event, CoreEvent::DuplicateDropped { .. })),
        1
    );
}

#[then(r#"the gap "{numbers}" in workflow "{workflow}" to "{recipient}" is skipped"#)]
fn gap_skipped(
    world: &DeliveryWorld,
    numbers: String,
    workflow: String,
    recipient: String,
) -> Result<()> {
    let missing = list(&numbers)
        .iter()
        .map(|number| number.parse::<u64>().map(SequenceNumber::new))
        .collect::<Result<Vec<_>, _>>()?;
    let expected = CoreEvent::SequenceGapSkipped {
        workflow_id: WorkflowId::from(workflow.as_str()),
        recipient: AgentId::from(recipient.as_str()),
        missing,
    };
    assert!(world.events.events().contains(&expected));
    Ok(())
}

#[then(r#"the submission is rejected by the "{rule}" rule"#)]
fn rejected_by(world: &DeliveryWorld, rule: String) -> Result<()> {
    let GateError::Rejected(rejection) = last_error(world)? else {
        return Err(eyre!("expected a rejection"));
    };
    assert_eq!(rejection.rule, rule);
    Ok(())
}

#[then("the circuit is open")]
fn circuit_open(world: &DeliveryWorld) -> Result<()> {
    assert_eq!(world.runtime()?.broker().circuit_phase(), CircuitPhase::Open);
    Ok(())
}

#[then("the last submission failed fast")]
fn failed_fast(world: &DeliveryWorld) -> Result<()> {
    assert!(matches!(
        last_error(world)?,
        GateError::Bus(BusError::Broker(BrokerError::CircuitOpen { .. }))
    ));
    Ok(())
}
