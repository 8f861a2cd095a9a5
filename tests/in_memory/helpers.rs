//! Shared helpers for runtime integration tests.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use switchyard::broker::adapters::memory::{InMemoryBroker, InMemoryDeadLetterSink};
use switchyard::clock::{ManualClock, TokioTimer};
use switchyard::config::{CoreConfig, ResourceLimitConfig};
use switchyard::delivery::{HandlerError, RecipientHandler};
use switchyard::events::RecordingEventSink;
use switchyard::message::domain::{Message, SequenceNumber};
use switchyard::runtime::SwitchyardRuntime;
use switchyard::verification::adapters::StaticAccessTable;

/// Runtime under test.
pub type TestRuntime = SwitchyardRuntime<InMemoryBroker, ManualClock>;

/// A running runtime plus handles on its test doubles.
pub struct Harness {
    pub port: InMemoryBroker,
    pub dead_letters: InMemoryDeadLetterSink,
    pub clock: ManualClock,
    pub events: RecordingEventSink,
    pub runtime: TestRuntime,
}

/// Default configuration with enough publish budget for a test.
pub fn roomy_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.rate_limits.default = ResourceLimitConfig {
        capacity: 1_000,
        ..ResourceLimitConfig::default()
    };
    config
}

impl Harness {
    /// Builds and connects a runtime over fresh in-memory doubles.
    ///
    /// `planner` and `coder` may message anyone.
    pub async fn start(config: CoreConfig) -> Self {
        let port = InMemoryBroker::new();
        let dead_letters = InMemoryDeadLetterSink::new();
        let clock = ManualClock::default();
        let events = RecordingEventSink::new();
        let access = StaticAccessTable::new()
            .default_for("planner", true)
            .default_for("coder", true);
        let runtime = SwitchyardRuntime::build(
            config,
            Arc::new(port.clone()),
            Arc::new(dead_letters.clone()),
            Arc::new(access),
            Arc::new(events.clone()),
            Arc::new(clock.clone()),
            Arc::new(TokioTimer),
        )
        .await
        .expect("runtime starts");
        Self {
            port,
            dead_letters,
            clock,
            events,
            runtime,
        }
    }

    /// Registers a recording inbox for `name`.
    pub async fn inbox(&self, name: &str) -> Inbox {
        let inbox = Inbox::default();
        self.runtime
            .bus()
            .register_recipient(name, Arc::new(inbox.clone()))
            .await
            .expect("registration succeeds");
        inbox
    }

    pub fn text(&self, from: &str, to: &str, text: &str) -> Message {
        Message::builder(from, to)
            .with_json(json!({ "text": text }))
            .build(&self.clock)
            .expect("valid message")
    }

    pub fn step(&self, to: &str, workflow: &str, text: &str) -> Message {
        Message::builder("planner", to)
            .with_json(json!({ "text": text }))
            .with_workflow(workflow)
            .build(&self.clock)
            .expect("valid message")
    }

    pub fn numbered(&self, to: &str, workflow: &str, sequence: u64) -> Message {
        Message::builder("planner", to)
            .with_json(json!({ "text": format!("step {sequence}") }))
            .with_workflow(workflow)
            .with_sequence(SequenceNumber::new(sequence))
            .build(&self.clock)
            .expect("valid message")
    }

    pub async fn settle(&self) {
        self.port.settle().await;
    }
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
        self.received().iter().map(text_of).collect()
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

pub fn text_of(message: &Message) -> String {
    message
        .payload()
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned()
}
