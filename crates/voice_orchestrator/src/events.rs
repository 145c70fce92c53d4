//! Orchestrator notifications
//!
//! Events are published on a broadcast channel after the state change they
//! describe has completed. Publishing never blocks and never fails an
//! operation: without subscribers events are dropped, and slow subscribers
//! see `RecvError::Lagged`.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;
use voice_provider::{OperationKind, ProviderId, ProviderKind};

/// Default channel capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something observable happened to a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// Provider reached the unhealthy threshold
    HealthDegraded {
        /// Affected provider
        provider_id: ProviderId,
        /// Failures counted at the flip
        consecutive_failures: u32,
        /// Last failure message
        last_error: Option<String>,
    },
    /// Provider reached the healthy threshold
    HealthRecovered {
        /// Affected provider
        provider_id: ProviderId,
        /// Successes counted at the flip
        consecutive_successes: u32,
    },
    /// A health probe exceeded the latency threshold
    LatencyDegraded {
        /// Affected provider
        provider_id: ProviderId,
        /// Measured probe latency
        latency_ms: u64,
        /// Configured threshold
        threshold_ms: u64,
    },
    /// Circuit opened (or reopened)
    CircuitOpened {
        /// Affected provider
        provider_id: ProviderId,
        /// Length of the open window
        retry_after_ms: u64,
        /// Consecutive reopens
        reopens: u32,
    },
    /// Circuit closed after successful trials
    CircuitClosed {
        /// Affected provider
        provider_id: ProviderId,
    },
    /// A fallback session switched away from a failed provider
    ProviderSwitched {
        /// Operation being served
        operation: OperationKind,
        /// Provider that failed
        from: ProviderId,
        /// Code of the error that caused the switch
        error_kind: String,
        /// Switches in this session so far
        switch_count: u32,
    },
    /// A provider was registered
    ProviderRegistered {
        /// New provider
        provider_id: ProviderId,
        /// Its kind
        kind: ProviderKind,
    },
    /// A provider was removed
    ProviderRemoved {
        /// Removed provider
        provider_id: ProviderId,
    },
    /// A provider was enabled or disabled
    ProviderEnabledChanged {
        /// Affected provider
        provider_id: ProviderId,
        /// New flag
        enabled: bool,
    },
}

impl OrchestratorEvent {
    /// Provider the event is about
    #[must_use]
    pub fn provider_id(&self) -> &ProviderId {
        match self {
            Self::HealthDegraded { provider_id, .. }
            | Self::HealthRecovered { provider_id, .. }
            | Self::LatencyDegraded { provider_id, .. }
            | Self::CircuitOpened { provider_id, .. }
            | Self::CircuitClosed { provider_id }
            | Self::ProviderRegistered { provider_id, .. }
            | Self::ProviderRemoved { provider_id }
            | Self::ProviderEnabledChanged { provider_id, .. } => provider_id,
            Self::ProviderSwitched { from, .. } => from,
        }
    }
}

/// Broadcast publisher for [`OrchestratorEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// Create a bus holding up to `capacity` undelivered events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event
    pub fn publish(&self, event: OrchestratorEvent) {
        if self.sender.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    /// Subscribe to events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast::error::RecvError;

    use super::*;

    fn removed(name: &str) -> OrchestratorEvent {
        OrchestratorEvent::ProviderRemoved {
            provider_id: ProviderId::parse(name).unwrap(),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        bus.publish(removed("a"));
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(removed("a"));
        bus.publish(removed("b"));
        assert_eq!(rx.recv().await.unwrap(), removed("a"));
        assert_eq!(rx.recv().await.unwrap(), removed("b"));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_without_blocking() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for name in ["a", "b", "c", "d"] {
            bus.publish(removed(name));
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(2))));
        assert_eq!(rx.recv().await.unwrap(), removed("c"));
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = OrchestratorEvent::CircuitClosed {
            provider_id: ProviderId::parse("whisper").unwrap(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "circuit_closed");
        assert_eq!(json["provider_id"], "whisper");
    }
}
