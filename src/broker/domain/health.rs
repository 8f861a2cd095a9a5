//! Health report for a broker connection.

use serde::{Deserialize, Serialize};

use super::CircuitPhase;

/// State of the underlying transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Connection is established.
    Open,
    /// Connection was lost or never established.
    Closed,
}

/// Status of one transport channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    /// Channel name as reported by the transport.
    pub name: String,
    /// Whether the channel is usable.
    pub open: bool,
}

/// Overall verdict of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Connection open and every channel usable.
    Healthy,
    /// Connection open but some channels are down or the circuit is not closed.
    Degraded,
    /// Connection not open.
    Unhealthy,
}

/// Report returned by a broker health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerHealth {
    /// Overall verdict.
    pub status: HealthStatus,
    /// Connection state.
    pub connection: ConnectionStatus,
    /// Per-channel state.
    pub channels: Vec<ChannelStatus>,
    /// Number of subscriptions the adapter keeps alive.
    pub subscriptions: usize,
    /// Current circuit breaker phase.
    pub circuit: CircuitPhase,
}

impl BrokerHealth {
    /// Builds a report, deriving the verdict from its parts.
    ///
    /// A connection that is not open is unhealthy regardless of channel
    /// state.
    #[must_use]
    pub fn assess(
        connection: ConnectionStatus,
        channels: Vec<ChannelStatus>,
        subscriptions: usize,
        circuit: CircuitPhase,
    ) -> Self {
        let status = match connection {
            ConnectionStatus::Closed => HealthStatus::Unhealthy,
            ConnectionStatus::Open
                if channels.iter().all(|channel| channel.open)
                    && circuit == CircuitPhase::Closed =>
            {
                HealthStatus::Healthy
            }
            ConnectionStatus::Open => HealthStatus::Degraded,
        };
        Self {
            status,
            connection,
            channels,
            subscriptions,
            circuit,
        }
    }
}
