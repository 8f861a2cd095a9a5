//! Given steps for delivery scenarios.

use std::sync::Arc;

use eyre::WrapErr;
use rstest_bdd_macros::given;
use switchyard::broker::ports::TransportError;

use super::world::{DeliveryWorld, Inbox, run_async};

#[given("a running switchyard")]
fn running_switchyard(world: &mut DeliveryWorld) -> Result<(), eyre::Report> {
    world.start()
}

#[given(r#"an inbox for "{agent}""#)]
fn inbox_for(world: &mut DeliveryWorld, agent: String) -> Result<(), eyre::Report> {
    let inbox = Inbox::default();
    run_async(
        world
            .runtime()?
            .bus()
            .register_recipient(agent.as_str(), Arc::new(inbox.clone())),
    )
    .wrap_err("register inbox")?;
    world.inboxes.insert(agent, inbox);
    Ok(())
}

#[given("the circuit opens after {failures:u32} failures")]
fn circuit_threshold(world: &mut DeliveryWorld, failures: u32) -> Result<(), eyre::Report> {
    let runtime = world.runtime()?;
    let mut config = runtime.config();
    config.broker.failure_threshold = failures;
    config.broker.publish_attempts = 1;
    runtime.reload(&config).wrap_err("reload broker settings")?;
    Ok(())
}

#[given("the broker fails every publish")]
fn broker_fails(world: &mut DeliveryWorld) {
    world
        .port
        .fail_all_publishes(Some(TransportError::Transient("broker down".to_owned())));
}
