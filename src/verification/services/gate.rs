//! Verification at the edges of the delivery bus.

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use minijinja::{Environment, context};
use mockable::Clock;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::pipeline::VerificationPipeline;
use crate::broker::domain::DeliveryId;
use crate::broker::ports::BrokerPort;
use crate::delivery::{DeliveryBus, HandlerError, RecipientHandler};
use crate::message::domain::{AgentId, GroupId, Message, Role};
use crate::verification::domain::{Outcome, Rejection};
use crate::verification::error::GateError;

/// Sender of rejection notices.
pub const GATE_AGENT_ID: &str = "verification-gate";

/// Metadata flag set on every rejection notice.
pub const REJECTION_FLAG_KEY: &str = "is_rejection";

/// Metadata key naming the refused message on a rejection notice.
pub const ORIGINAL_MESSAGE_ID_KEY: &str = "original_message_id";

/// Notice text. Rendered with `message_id`, `recipient` and `reason`.
pub const DEFAULT_REJECTION_TEMPLATE: &str =
    "Your message {{ message_id }} to {{ recipient }} was not delivered: {{ reason }}";

/// Runs outbound messages through the pipeline before they reach the bus,
/// and wraps recipients so inbound messages are checked before handling.
pub struct VerificationGate<P, C>
where
    P: BrokerPort + 'static,
    C: Clock + Send + Sync + 'static,
{
    pipeline: Arc<VerificationPipeline>,
    bus: Arc<DeliveryBus<P, C>>,
    clock: Arc<C>,
    agent_id: AgentId,
    template: RwLock<String>,
}

impl<P, C> VerificationGate<P, C>
where
    P: BrokerPort + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Creates a gate in front of `bus`.
    #[must_use]
    pub fn new(
        pipeline: Arc<VerificationPipeline>,
        bus: Arc<DeliveryBus<P, C>>,
        clock: Arc<C>,
    ) -> Self {
        Self {
            pipeline,
            bus,
            clock,
            agent_id: AgentId::from(GATE_AGENT_ID),
            template: RwLock::new(DEFAULT_REJECTION_TEMPLATE.to_owned()),
        }
    }

    /// Returns the gate with a different rejection notice template.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Template`] if the template does not parse.
    pub fn with_template(self, template: impl Into<String>) -> Result<Self, GateError> {
        self.set_template(template)?;
        Ok(self)
    }

    /// Replaces the rejection notice template of a live gate.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Template`] if the template does not parse; the
    /// previous template stays in force.
    pub fn set_template(&self, template: impl Into<String>) -> Result<(), GateError> {
        let source = template.into();
        Environment::new()
            .template_from_str(&source)
            .map_err(|error| GateError::Template(error.to_string()))?;
        *self.template.write().unwrap_or_else(PoisonError::into_inner) = source;
        Ok(())
    }

    /// Returns the pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &Arc<VerificationPipeline> {
        &self.pipeline
    }

    /// Returns the bus.
    #[must_use]
    pub const fn bus(&self) -> &Arc<DeliveryBus<P, C>> {
        &self.bus
    }

    /// Verifies `message` and sends it, or refuses it and notifies the
    /// sender.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Rejected`] if a validator refused the message
    /// or [`GateError::Bus`] if the bus could not send it.
    pub async fn submit(&self, message: Message) -> Result<DeliveryId, GateError> {
        let sender = message.sender().clone();
        let recipient = message.recipient().clone();
        match self.pipeline.process(message) {
            Outcome::Rejected(rejection) => {
                self.notify(&sender, &recipient, &rejection).await;
                Err(GateError::Rejected(rejection))
            }
            Outcome::Accepted(verified) | Outcome::Sanitized(verified) => {
                Ok(self.bus.send(verified).await?)
            }
        }
    }

    /// Verifies `message` once and fans it out to `group`.
    ///
    /// # Errors
    ///
    /// As [`Self::submit`], with group errors from
    /// [`DeliveryBus::send_to_group`].
    pub async fn submit_to_group(
        &self,
        message: Message,
        group: &GroupId,
    ) -> Result<Vec<DeliveryId>, GateError> {
        let sender = message.sender().clone();
        match self.pipeline.process(message) {
            Outcome::Rejected(rejection) => {
                let target = AgentId::new(group.as_str());
                self.notify(&sender, &target, &rejection).await;
                Err(GateError::Rejected(rejection))
            }
            Outcome::Accepted(verified) | Outcome::Sanitized(verified) => {
                Ok(self.bus.send_to_group(&verified, group).await?)
            }
        }
    }

    /// Wraps `handler` so it only sees messages that pass verification.
    ///
    /// Refused messages are acknowledged and dropped.
    #[must_use]
    pub fn guard(&self, handler: Arc<dyn RecipientHandler>) -> Arc<dyn RecipientHandler> {
        Arc::new(GuardedHandler {
            pipeline: Arc::clone(&self.pipeline),
            inner: handler,
        })
    }

    async fn notify(&self, sender: &AgentId, recipient: &AgentId, rejection: &Rejection) {
        if *sender == self.agent_id {
            return;
        }
        let notice = match self.rejection_notice(sender, recipient, rejection) {
            Ok(notice) => notice,
            Err(error) => {
                warn!(message_id = %rejection.message_id, %error, "rejection notice not built");
                return;
            }
        };
        if let Err(error) = self.bus.send(notice).await {
            warn!(
                message_id = %rejection.message_id,
                sender = %sender,
                %error,
                "rejection notice not sent"
            );
        }
    }

    fn rejection_notice(
        &self,
        sender: &AgentId,
        recipient: &AgentId,
        rejection: &Rejection,
    ) -> Result<Message, GateError> {
        let template = self
            .template
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let text = Environment::new()
            .render_str(
                &template,
                context! {
                    message_id => rejection.message_id.as_str(),
                    recipient => recipient.as_str(),
                    reason => rejection.reason.as_str(),
                },
            )
            .map_err(|error| GateError::Template(error.to_string()))?;
        Message::builder(self.agent_id.clone(), sender.clone())
            .with_role(Role::System)
            .with_json(json!({ "text": text, "reason": rejection.reason }))
            .with_metadata(REJECTION_FLAG_KEY, Value::Bool(true))
            .with_metadata(
                ORIGINAL_MESSAGE_ID_KEY,
                Value::String(rejection.message_id.as_str().to_owned()),
            )
            .build(self.clock.as_ref())
            .map_err(GateError::from)
    }
}

struct GuardedHandler {
    pipeline: Arc<VerificationPipeline>,
    inner: Arc<dyn RecipientHandler>,
}

#[async_trait]
impl RecipientHandler for GuardedHandler {
    async fn handle(&self, message: &Message) -> Result<Option<Message>, HandlerError> {
        match self.pipeline.process(message.clone()) {
            Outcome::Rejected(rejection) => {
                debug!(
                    message_id = %rejection.message_id,
                    rule = %rejection.rule,
                    "inbound message dropped"
                );
                Ok(None)
            }
            Outcome::Accepted(verified) | Outcome::Sanitized(verified) => {
                self.inner.handle(&verified).await
            }
        }
    }
}
