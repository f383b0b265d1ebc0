//! Broadcast Channel Adapter
//!
//! Implements listener fan-out using a tokio broadcast channel. Every
//! provider owns one [`EventHub`]; each registered listener holds its own
//! receiver, so publishing never blocks on slow listeners (they observe
//! `Lagged` instead).

use tokio::sync::broadcast;

use crate::BroadcastSettings;
use crate::application::ports::ProviderEvent;

/// Configuration for the event channel.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    /// Capacity of the provider event channel.
    pub event_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            event_capacity: 10_000,
        }
    }
}

impl From<&BroadcastSettings> for BroadcastConfig {
    fn from(settings: &BroadcastSettings) -> Self {
        Self {
            event_capacity: settings.event_capacity,
        }
    }
}

/// Fan-out point for a provider's events.
///
/// # Example
///
/// ```rust
/// use livedata_fabric::infrastructure::broadcast::{BroadcastConfig, EventHub};
///
/// let hub = EventHub::new(BroadcastConfig::default());
/// let _rx = hub.subscribe();
/// assert_eq!(hub.receiver_count(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<ProviderEvent>,
}

impl EventHub {
    /// Create a hub with the given configuration.
    #[must_use]
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            tx: broadcast::channel(config.event_capacity.max(1)).0,
        }
    }

    /// Create a hub with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BroadcastConfig::default())
    }

    /// Publish an event to all listeners.
    ///
    /// Returns the number of listeners reached; zero when none are registered.
    pub fn publish(&self, event: ProviderEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Register a new listener.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.tx.subscribe()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

// =============================================================================
// Tests
// =============================================================================
