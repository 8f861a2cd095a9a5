//! Assembly of every component from one [`CoreConfig`].
//!
//! [`SwitchyardRuntime`] wires the resilient broker adapter, the rate
//! limiter, the dedup cache, the sequence tracker, the delivery bus, the
//! verification pipeline and the gate, then keeps them reconfigurable
//! through [`SwitchyardRuntime::reload`].

mod error;

use std::sync::{Arc, PoisonError, RwLock};

use mockable::Clock;
use tracing::{info, warn};

pub use error::RuntimeError;

use crate::broker::ports::{BrokerPort, DeadLetterSink};
use crate::broker::services::ResilientBroker;
use crate::clock::Timer;
use crate::config::{CoreConfig, DeliveryConfig, RateLimitConfig};
use crate::delivery::DeliveryBus;
use crate::events::EventSink;
use crate::rate_limit::AdaptiveRateLimiter;
use crate::sequencing::{DedupCache, SequenceTracker};
use crate::verification::ports::AccessTable;
use crate::verification::{RuleRegistry, VerificationGate, VerificationPipeline};

/// A connected, running set of components.
pub struct SwitchyardRuntime<P, C>
where
    P: BrokerPort + 'static,
    C: Clock + Send + Sync + 'static,
{
    config: RwLock<CoreConfig>,
    registry: RuleRegistry,
    limiter: Arc<AdaptiveRateLimiter<C>>,
    broker: Arc<ResilientBroker<P, C>>,
    dedup: Arc<DedupCache<C>>,
    tracker: Arc<SequenceTracker<C>>,
    bus: Arc<DeliveryBus<P, C>>,
    pipeline: Arc<VerificationPipeline>,
    gate: VerificationGate<P, C>,
}

impl<P, C> SwitchyardRuntime<P, C>
where
    P: BrokerPort + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Validates `config`, builds every component, connects the broker and
    /// starts the delivery sweeper.
    ///
    /// Permission validators consult `access_table`.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] if the configuration is invalid, the rules
    /// do not build or the broker cannot connect.
    pub async fn build(
        config: CoreConfig,
        port: Arc<P>,
        dead_letters: Arc<dyn DeadLetterSink>,
        access_table: Arc<dyn AccessTable>,
        events: Arc<dyn EventSink>,
        clock: Arc<C>,
        timer: Arc<dyn Timer>,
    ) -> Result<Self, RuntimeError> {
        Self::build_with_registry(
            config,
            port,
            dead_letters,
            RuleRegistry::new(access_table),
            events,
            clock,
            timer,
        )
        .await
    }

    /// As [`Self::build`], with a registry that may carry custom rule
    /// kinds.
    ///
    /// # Errors
    ///
    /// As [`Self::build`].
    pub async fn build_with_registry(
        config: CoreConfig,
        port: Arc<P>,
        dead_letters: Arc<dyn DeadLetterSink>,
        registry: RuleRegistry,
        events: Arc<dyn EventSink>,
        clock: Arc<C>,
        timer: Arc<dyn Timer>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;
        let rules = registry.build(&config.verification.rules)?;

        let limiter = Arc::new(AdaptiveRateLimiter::new(
            Arc::clone(&clock),
            Arc::clone(&timer),
            Arc::clone(&events),
        ));
        apply_rate_limits(&limiter, &config.rate_limits);

        let broker = Arc::new(
            ResilientBroker::new(
                port,
                config.broker.settings(),
                dead_letters,
                Arc::clone(&clock),
                Arc::clone(&timer),
                Arc::clone(&events),
            )
            .with_rate_limiter(Arc::clone(&limiter)),
        );
        broker.connect().await?;

        let dedup = Arc::new(DedupCache::new(
            config.delivery.dedup_ttl(),
            Arc::clone(&clock),
        ));
        let tracker = Arc::new(SequenceTracker::new(
            config.delivery.sequencing(),
            Arc::clone(&clock),
        ));
        let bus = Arc::new(DeliveryBus::new(
            Arc::clone(&broker),
            Arc::clone(&dedup),
            Arc::clone(&tracker),
            config.delivery.bus(),
            Arc::clone(&clock),
            Arc::clone(&events),
        ));
        bus.spawn_sweeper(timer);

        let pipeline = Arc::new(VerificationPipeline::new(rules, events));
        let gate = VerificationGate::new(Arc::clone(&pipeline), Arc::clone(&bus), clock)
            .with_template(config.verification.rejection_template.clone())?;

        info!(broker = %config.broker.name, "switchyard runtime started");
        Ok(Self {
            config: RwLock::new(config),
            registry,
            limiter,
            broker,
            dedup,
            tracker,
            bus,
            pipeline,
            gate,
        })
    }

    /// Returns the configuration in force.
    #[must_use]
    pub fn config(&self) -> CoreConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the resilient broker adapter.
    #[must_use]
    pub const fn broker(&self) -> &Arc<ResilientBroker<P, C>> {
        &self.broker
    }

    /// Returns the rate limiter.
    #[must_use]
    pub const fn limiter(&self) -> &Arc<AdaptiveRateLimiter<C>> {
        &self.limiter
    }

    /// Returns the delivery bus.
    #[must_use]
    pub const fn bus(&self) -> &Arc<DeliveryBus<P, C>> {
        &self.bus
    }

    /// Returns the verification pipeline.
    #[must_use]
    pub const fn pipeline(&self) -> &Arc<VerificationPipeline> {
        &self.pipeline
    }

    /// Returns the verification gate.
    #[must_use]
    pub const fn gate(&self) -> &VerificationGate<P, C> {
        &self.gate
    }

    /// Applies a new configuration to the live components.
    ///
    /// Broker tunables, rate limits, dedup and sequencing timeouts, rules
    /// and the notice template take effect immediately; in-flight
    /// workflows keep their sequence state. Topic prefix and sweep
    /// interval are fixed at build time and changes to them are ignored
    /// with a warning. Nothing is applied unless the whole configuration
    /// is valid.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] if the configuration is invalid or its
    /// rules or template do not build.
    pub fn reload(&self, config: &CoreConfig) -> Result<(), RuntimeError> {
        config.validate()?;
        let rules = self.registry.build(&config.verification.rules)?;
        self.gate
            .set_template(config.verification.rejection_template.clone())?;

        let mut current = self.config.write().unwrap_or_else(PoisonError::into_inner);
        if config.delivery.bus() != current.delivery.bus() {
            warn!("topic prefix and sweep interval changes need a restart");
        }
        self.broker.reconfigure(config.broker.settings());
        apply_rate_limits(&self.limiter, &config.rate_limits);
        self.dedup.set_ttl(config.delivery.dedup_ttl());
        self.tracker.reconfigure(config.delivery.sequencing());
        self.pipeline.reload(rules);

        *current = CoreConfig {
            delivery: DeliveryConfig {
                topic_prefix: current.delivery.topic_prefix.clone(),
                sweep_interval_ms: current.delivery.sweep_interval_ms,
                ..config.delivery.clone()
            },
            ..config.clone()
        };
        info!("switchyard runtime reconfigured");
        Ok(())
    }

    /// Stops the sweeper and closes the broker adapter.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Bus`] if the broker failed to close.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.bus.close().await?;
        info!("switchyard runtime stopped");
        Ok(())
    }
}

fn apply_rate_limits<C: Clock + Send + Sync>(
    limiter: &AdaptiveRateLimiter<C>,
    limits: &RateLimitConfig,
) {
    limiter.set_defaults(limits.default.bucket(), limits.default.health.thresholds());
    for (resource, limit) in &limits.resources {
        limiter.configure(resource, limit.bucket());
        limiter.configure_health(resource, limit.health.thresholds());
    }
}
