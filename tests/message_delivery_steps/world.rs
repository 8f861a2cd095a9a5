//! World state for delivery scenarios.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use eyre::{WrapErr, eyre};
use rstest::fixture;
use serde_json::Value;
use switchyard::broker::adapters::memory::{InMemoryBroker, InMemoryDeadLetterSink};
use switchyard::broker::domain::DeliveryId;
use switchyard::clock::{ManualClock, TokioTimer};
use switchyard::config::{CoreConfig, ResourceLimitConfig};
use switchyard::delivery::{HandlerError, RecipientHandler};
use switchyard::events::RecordingEventSink;
use switchyard::message::domain::Message;
use switchyard::runtime::SwitchyardRuntime;
use switchyard::verification::GateError;
use switchyard::verification::adapters::StaticAccessTable;

pub type TestRuntime = SwitchyardRuntime<InMemoryBroker, ManualClock>;

/// World state for delivery scenarios.
pub struct DeliveryWorld {
    pub port: InMemoryBroker,
    pub dead_letters: InMemoryDeadLetterSink,
    pub clock: ManualClock,
    pub events: RecordingEventSink,
    pub runtime: Option<TestRuntime>,
    pub inboxes: HashMap<String, Inbox>,
    pub last_submission: Option<Result<DeliveryId, GateError>>,
}

impl Default for DeliveryWorld {
    fn default() -> Self {
        Self {
            port: InMemoryBroker::new(),
            dead_letters: InMemoryDeadLetterSink::new(),
            clock: ManualClock::default(),
            events: RecordingEventSink::new(),
            runtime: None,
            inboxes: HashMap::new(),
            last_submission: None,
        }
    }
}

#[fixture]
pub fn world() -> DeliveryWorld {
    DeliveryWorld::default()
}

impl DeliveryWorld {
    pub fn start(&mut self) -> Result<(), eyre::Report> {
        let mut config = CoreConfig::default();
        config.rate_limits.default = ResourceLimitConfig {
            capacity: 1_000,
            ..ResourceLimitConfig::default()
        };
        let runtime = run_async(SwitchyardRuntime::build(
            config,
            Arc::new(self.port.clone()),
            Arc::new(self.dead_letters.clone()),
            Arc::new(StaticAccessTable::new().default_for("planner", true)),
            Arc::new(self.events.clone()),
            Arc::new(self.clock.clone()),
            Arc::new(TokioTimer),
        ))
        .wrap_err("start runtime")?;
        self.runtime = Some(runtime);
        Ok(())
    }

    pub fn runtime(&self) -> Result<&TestRuntime, eyre::Report> {
        self.runtime
            .as_ref()
            .ok_or_else(|| eyre!("runtime not started"))
    }

    pub fn inbox(&self, agent: &str) -> Result<&Inbox, eyre::Report> {
        self.inboxes
            .get(agent)
            .ok_or_else(|| eyre!("no inbox for {agent}"))
    }

    pub fn settle(&self) {
        run_async(self.port.settle());
    }
}

pub fn run_async<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}

/// Splits a comma-separated step argument.
pub fn list(items: &str) -> Vec<String> {
    items
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Recipient that records every message it is handed.
#[derive(Clone, Default)]
pub struct Inbox {
    received: Arc<Mutex<Vec<Message>>>,
}

impl Inbox {
    pub fn received(&self) -> Vec<Message> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|message| {
                message
                    .payload()
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned()
            })
            .collect()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.received()
            .iter()
            .filter_map(|message| message.sequence().map(|sequence| sequence.value()))
            .collect()
    }
}

#[async_trait]
impl RecipientHandler for Inbox {
    async fn handle(&self, message: &Message) -> Result<Option<Message>, HandlerError> {
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(None)
    }
}
