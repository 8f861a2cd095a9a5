//! Shared fixtures for delivery bus tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::broker::adapters::memory::{InMemoryBroker, InMemoryDeadLetterSink};
use crate::broker::services::{BrokerSettings, ResilientBroker};
use crate::clock::ManualClock;
use crate::delivery::{BusSettings, DeliveryBus, HandlerError, RecipientHandler};
use crate::events::RecordingEventSink;
use crate::message::domain::{AgentId, Message, SequenceNumber};
use crate::sequencing::{DEFAULT_DEDUP_TTL, DedupCache, SequenceSettings, SequenceTracker};

pub type TestBus = DeliveryBus<InMemoryBroker, ManualClock>;

pub struct BusHarness {
    pub port: InMemoryBroker,
    pub dead_letters: InMemoryDeadLetterSink,
    pub clock: ManualClock,
    pub events: RecordingEventSink,
    pub bus: Arc<TestBus>,
}

impl BusHarness {
    pub async fn start() -> Self {
        Self::with_sequencing(SequenceSettings::default()).await
    }

    pub async fn with_sequencing(sequencing: SequenceSettings) -> Self {
        let port = InMemoryBroker::new();
        let dead_letters = InMemoryDeadLetterSink::new();
        let clock = ManualClock::default();
        let events = RecordingEventSink::new();
        let shared_clock = Arc::new(clock.clone());
        let broker = Arc::new(ResilientBroker::new(
            Arc::new(port.clone()),
            BrokerSettings::default(),
            Arc::new(dead_letters.clone()),
            Arc::clone(&shared_clock),
            Arc::new(clock.clone()),
            Arc::new(events.clone()),
        ));
        broker.connect().await.expect("in-memory broker connects");
        let bus = Arc::new(DeliveryBus::new(
            broker,
            Arc::new(DedupCache::new(DEFAULT_DEDUP_TTL, Arc::clone(&shared_clock))),
            Arc::new(SequenceTracker::new(sequencing, Arc::clone(&shared_clock))),
            BusSettings::default(),
            shared_clock,
            Arc::new(events.clone()),
        ));
        Self {
            port,
            dead_letters,
            clock,
            events,
            bus,
        }
    }

    pub async fn agent(&self, name: &str) -> Agent {
        let agent = Agent::new(name, self.clock.clone());
        self.bus
            .register_recipient(name, Arc::new(agent.clone()))
            .await
            .expect("registration succeeds");
        agent
    }

    pub fn text(&self, from: &str, to: &str, text: &str) -> Message {
        Message::builder(from, to)
            .with_json(json!({ "text": text }))
            .build(&self.clock)
            .expect("valid message")
    }

    pub fn step(&self, from: &str, to: &str, workflow: &str, text: &str) -> Message {
        Message::builder(from, to)
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

/// Recipient that records what it processed and can fail or reply on cue.
#[derive(Clone)]
pub struct Agent {
    name: AgentId,
    clock: ManualClock,
    received: Arc<Mutex<Vec<Message>>>,
    failures: Arc<Mutex<HashMap<String, u32>>>,
    replies: bool,
}

impl Agent {
    pub fn new(name: &str, clock: ManualClock) -> Self {
        Self {
            name: AgentId::from(name),
            clock,
            received: Arc::default(),
            failures: Arc::default(),
            replies: false,
        }
    }

    pub fn replying(mut self) -> Self {
        self.replies = true;
        self
    }

    /// Fails the next `times` attempts at the message whose text is `text`.
    pub fn fail_on(&self, text: &str, times: u32) {
        self.failures
            .lock()
            .expect("failures lock")
            .insert(text.to_owned(), times);
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().expect("received lock").clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.received().iter().map(text_of).collect()
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

#[async_trait]
impl RecipientHandler for Agent {
    async fn handle(&self, message: &Message) -> Result<Option<Message>, HandlerError> {
        let text = text_of(message);
        {
            let mut failures = self.failures.lock().expect("failures lock");
            if let Some(remaining) = failures.get_mut(&text)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(HandlerError::new(format!("cannot process {text}")));
            }
        }
        self.received
            .lock()
            .expect("received lock")
            .push(message.clone());
        if !self.replies {
            return Ok(None);
        }
        let reply = Message::builder(self.name.clone(), message.sender().clone())
            .with_json(json!({ "text": format!("re: {text}") }))
            .build(&self.clock)
            .map_err(|err| HandlerError::new(err.to_string()))?;
        Ok(Some(reply))
    }
}
