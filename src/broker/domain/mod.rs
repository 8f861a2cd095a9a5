//! Domain types for the broker layer.

mod circuit;
mod dead_letter;
mod delivery;
mod health;
mod ids;

pub use circuit::{Admission, CircuitPhase, CircuitSettings, CircuitState, CircuitTransition};
pub use dead_letter::{DEFAULT_DEAD_LETTER_PREFIX, DeadLetterEntry, dead_letter_destination};
pub use delivery::{Delivery, NackDisposition};
pub use health::{BrokerHealth, ChannelStatus, ConnectionStatus, HealthStatus};
pub use ids::{DeliveryId, SubscriptionId, Topic};
