//! Fail-fast validation followed by chained sanitization.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info};

use super::registry::RuleSet;
use crate::events::{CoreEvent, EventSink};
use crate::message::domain::Message;
use crate::verification::domain::{Outcome, Rejection, RuleViolation, VerificationResult};

/// Runs messages through the current rule set.
///
/// The pipeline holds no per-message state; the rule set can be swapped at
/// any time and in-flight messages finish against the set they started
/// with.
pub struct VerificationPipeline {
    rules: RwLock<Arc<RuleSet>>,
    events: Arc<dyn EventSink>,
}

struct Run {
    violation: Option<RuleViolation>,
    message: Message,
    changed_by: Vec<String>,
}

impl VerificationPipeline {
    /// Creates a pipeline over `rules`.
    #[must_use]
    pub fn new(rules: RuleSet, events: Arc<dyn EventSink>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            events,
        }
    }

    /// Returns the rule set currently in force.
    #[must_use]
    pub fn rules(&self) -> Arc<RuleSet> {
        Arc::clone(&self.rules.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replaces the rule set.
    pub fn reload(&self, rules: RuleSet) {
        let names = rules.names();
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(rules);
        info!(rules = ?names, "verification rules reloaded");
    }

    /// Decides whether `message` may be delivered and in which form.
    #[must_use]
    pub fn process(&self, message: Message) -> Outcome {
        let run = self.run(message);
        if let Some(violation) = run.violation {
            let rejection = Rejection::from_violation(run.message.id().clone(), &violation);
            debug!(
                message_id = %rejection.message_id,
                rule = %violation.rule,
                detail = violation.detail.as_deref().unwrap_or_default(),
                "message rejected"
            );
            self.events.emit(CoreEvent::VerificationRejected {
                message_id: rejection.message_id.clone(),
                rule: rejection.rule.clone(),
                reason: rejection.reason.clone(),
            });
            return Outcome::Rejected(rejection);
        }
        if run.changed_by.is_empty() {
            return Outcome::Accepted(run.message);
        }
        self.events.emit(CoreEvent::VerificationSanitized {
            message_id: run.message.id().clone(),
            rules: run.changed_by,
        });
        Outcome::Sanitized(run.message)
    }

    /// Reports the verdict on `message` without emitting events.
    #[must_use]
    pub fn verify(&self, message: &Message) -> VerificationResult {
        let run = self.run(message.clone());
        match run.violation {
            Some(violation) => VerificationResult {
                valid: false,
                errors: vec![(violation.rule, violation.reason)],
                sanitized: None,
            },
            None => VerificationResult {
                valid: true,
                errors: Vec::new(),
                sanitized: (!run.changed_by.is_empty()).then_some(run.message),
            },
        }
    }

    fn run(&self, message: Message) -> Run {
        let rules = self.rules();
        let failure = rules
            .validators()
            .iter()
            .filter(|rule| rule.descriptor().enabled)
            .find_map(|rule| rule.check(&message).err());
        if failure.is_some() {
            return Run {
                violation: failure,
                message,
                changed_by: Vec::new(),
            };
        }

        let mut current = message;
        let mut changed_by = Vec::new();
        for rule in rules
            .sanitizers()
            .iter()
            .filter(|rule| rule.descriptor().enabled)
        {
            if let Some(rewritten) = rule.transform(&current) {
                changed_by.push(rule.descriptor().name.clone());
                current = rewritten;
            }
        }
        Run {
            violation: None,
            message: current,
            changed_by,
        }
    }
}
