//! Heartbeat Leases
//!
//! Keeps upstream publication of a specification alive while a consumer
//! still cares about it. A [`HeartbeatSender`] periodically announces the
//! specifications its source is interested in; a [`HeartbeatReceiver`]
//! refreshes a per-specification lease on every message and, on a periodic
//! sweep, reports specifications whose lease ran out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::HeartbeatSettings;
use crate::application::ports::LiveDataProvider;
use crate::domain::market_data::Specification;
use crate::infrastructure::metrics;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Interval between announcements, and between lease sweeps.
    pub interval: Duration,
    /// How long a lease lasts without a refresh.
    pub lease_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(90),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(interval: Duration, lease_timeout: Duration) -> Self {
        Self {
            interval,
            lease_timeout,
        }
    }
}

impl From<&HeartbeatSettings> for HeartbeatConfig {
    fn from(settings: &HeartbeatSettings) -> Self {
        Self::new(settings.interval, settings.lease_timeout)
    }
}

/// One-way announcement of the specifications still of interest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Specifications to keep alive.
    pub specifications: Vec<Specification>,
}

/// Events emitted by the heartbeat receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// No heartbeat arrived for the specification before its lease expired.
    LeaseExpired(Specification),
}

/// Anything that can say which specifications it still needs.
pub trait HeartbeatSource: Send + Sync {
    /// Specifications currently of interest.
    fn specifications(&self) -> Vec<Specification>;
}

impl<P: LiveDataProvider + ?Sized> HeartbeatSource for P {
    fn specifications(&self) -> Vec<Specification> {
        self.active_specifications()
    }
}

// =============================================================================
// Sender
// =============================================================================

/// Periodically announces a source's specifications.
pub struct HeartbeatSender {
    config: HeartbeatConfig,
    source: Arc<dyn HeartbeatSource>,
    tx: mpsc::Sender<HeartbeatMessage>,
    cancel: CancellationToken,
}

impl HeartbeatSender {
    /// Create a new heartbeat sender.
    #[must_use]
    pub fn new(
        config: HeartbeatConfig,
        source: Arc<dyn HeartbeatSource>,
        tx: mpsc::Sender<HeartbeatMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            source,
            tx,
            cancel,
        }
    }

    /// Run until cancelled or the receiving side goes away.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat sender cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let specifications = self.source.specifications();
                    if specifications.is_empty() {
                        continue;
                    }
                    let count = specifications.len();
                    if self.tx.send(HeartbeatMessage { specifications }).await.is_err() {
                        tracing::debug!("Heartbeat channel closed, stopping sender");
                        break;
                    }
                    tracing::trace!(count, "Heartbeat sent");
                }
            }
        }
    }
}

// =============================================================================
// Lease Table
// =============================================================================

/// Per-specification lease deadlines.
#[derive(Debug)]
pub struct LeaseTable {
    lease_timeout: Duration,
    deadlines: Mutex<HashMap<Specification, Instant>>,
}

impl LeaseTable {
    /// Create an empty table.
    #[must_use]
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            lease_timeout,
            deadlines: Mutex::new(HashMap::new()),
        }
    }

    /// Extend the leases of `specifications` from `now`.
    pub fn refresh_at(&self, specifications: &[Specification], now: Instant) {
        let deadline = now + self.lease_timeout;
        let mut deadlines = self.deadlines.lock();
        for specification in specifications {
            deadlines.insert(specification.clone(), deadline);
        }
    }

    /// Extend the leases of `specifications` from the current instant.
    pub fn refresh(&self, specifications: &[Specification]) {
        self.refresh_at(specifications, Instant::now());
    }

    /// Remove and return every lease whose deadline is before `now`.
    pub fn expire_at(&self, now: Instant) -> Vec<Specification> {
        let mut expired = Vec::new();
        self.deadlines.lock().retain(|specification, deadline| {
            if *deadline < now {
                expired.push(specification.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Whether `specification` currently holds a lease.
    #[must_use]
    pub fn contains(&self, specification: &Specification) -> bool {
        self.deadlines.lock().contains_key(specification)
    }

    /// Number of live leases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deadlines.lock().len()
    }

    /// Whether no lease is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deadlines.lock().is_empty()
    }
}

// =============================================================================
// Receiver
// =============================================================================

/// Refreshes leases from heartbeats and reports expiries.
pub struct HeartbeatReceiver {
    config: HeartbeatConfig,
    leases: Arc<LeaseTable>,
    rx: mpsc::Receiver<HeartbeatMessage>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatReceiver {
    /// Create a new heartbeat receiver.
    #[must_use]
    pub fn new(
        config: HeartbeatConfig,
        rx: mpsc::Receiver<HeartbeatMessage>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            leases: Arc::new(LeaseTable::new(config.lease_timeout)),
            rx,
            event_tx,
            cancel,
        }
    }

    /// Shared handle on the lease table.
    #[must_use]
    pub fn leases(&self) -> Arc<LeaseTable> {
        Arc::clone(&self.leases)
    }

    /// Run until cancelled, the heartbeat channel closes, or nobody listens
    /// for expiries anymore.
    pub async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.config.interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat receiver cancelled");
                    break;
                }
                message = self.rx.recv() => {
                    let Some(message) = message else {
                        tracing::debug!("Heartbeat channel closed, stopping receiver");
                        break;
                    };
                    metrics::record_heartbeat_received();
                    self.leases.refresh(&message.specifications);
                }
                _ = sweep.tick() => {
                    if self.sweep().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Emit an expiry for every lapsed lease.
    ///
    /// Returns `Err(())` if the event channel is closed.
    async fn sweep(&self) -> Result<(), ()> {
        for specification in self.leases.expire_at(Instant::now()) {
            tracing::warn!(specification = %specification, "Heartbeat lease expired");
            metrics::record_lease_expired();
            if self
                .event_tx
                .send(HeartbeatEvent::LeaseExpired(specification))
                .await
                .is_err()
            {
                tracing::debug!("Event channel closed, stopping heartbeat receiver");
                return Err(());
            }
        }
        Ok(())
    }
}
