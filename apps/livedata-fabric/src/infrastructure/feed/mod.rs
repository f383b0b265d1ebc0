//! Market Data Feed Adapters
//!
//! [`InMemoryFeed`] is an in-process upstream: it records which
//! specifications are subscribed, can refuse instruments or be marked
//! unreachable, and pushes [`FeedEvent`]s into a channel.
//! [`run_feed_handler`] drains that channel into a [`SnapshotProvider`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FeedError, MarketDataFeed};
use crate::application::services::SnapshotProvider;
use crate::domain::market_data::{FieldMap, Specification};

/// Events pushed by an upstream feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Connection established.
    Connected,
    /// Connection lost.
    Disconnected,
    /// Field update for one specification.
    Tick {
        /// Series the tick belongs to.
        specification: Specification,
        /// Fields carried by the tick.
        fields: FieldMap,
    },
}

/// In-process upstream feed.
#[derive(Debug)]
pub struct InMemoryFeed {
    name: String,
    events: mpsc::Sender<FeedEvent>,
    subscribed: Mutex<HashSet<Specification>>,
    rejected: Mutex<HashSet<Specification>>,
    reachable: AtomicBool,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
}

impl InMemoryFeed {
    /// Create a feed and the receiving end of its event channel.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<FeedEvent>) {
        let (events, rx) = mpsc::channel(capacity.max(1));
        let feed = Self {
            name: name.into(),
            events,
            subscribed: Mutex::new(HashSet::new()),
            rejected: Mutex::new(HashSet::new()),
            reachable: AtomicBool::new(true),
            subscribe_calls: AtomicUsize::new(0),
            unsubscribe_calls: AtomicUsize::new(0),
        };
        (feed, rx)
    }

    /// Refuse future subscriptions to `specification`.
    pub fn reject_instrument(&self, specification: Specification) {
        self.rejected.lock().insert(specification);
    }

    /// Mark the feed reachable or not.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Whether `specification` is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, specification: &Specification) -> bool {
        self.subscribed.lock().contains(specification)
    }

    /// Currently subscribed specifications.
    #[must_use]
    pub fn subscribed(&self) -> Vec<Specification> {
        self.subscribed.lock().iter().cloned().collect()
    }

    /// Number of subscribe calls received.
    #[must_use]
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of unsubscribe calls received.
    #[must_use]
    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    /// Push an event downstream.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable` if the event channel is closed.
    pub async fn publish(&self, event: FeedEvent) -> Result<(), FeedError> {
        self.events
            .send(event)
            .await
            .map_err(|_| FeedError::Unreachable(format!("{} event channel closed", self.name)))
    }

    /// Push a tick downstream.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable` if the event channel is closed.
    pub async fn publish_tick(
        &self,
        specification: Specification,
        fields: FieldMap,
    ) -> Result<(), FeedError> {
        self.publish(FeedEvent::Tick {
            specification,
            fields,
        })
        .await
    }

    fn ensure_reachable(&self) -> Result<(), FeedError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FeedError::Unreachable(self.name.clone()))
        }
    }
}

#[async_trait]
impl MarketDataFeed for InMemoryFeed {
    async fn subscribe(&self, specifications: &[Specification]) -> Result<(), FeedError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_reachable()?;

        {
            let rejected = self.rejected.lock();
            if let Some(unknown) = specifications.iter().find(|s| rejected.contains(*s)) {
                return Err(FeedError::UnknownInstrument(unknown.clone()));
            }
        }

        self.subscribed
            .lock()
            .extend(specifications.iter().cloned());
        tracing::debug!(feed = %self.name, count = specifications.len(), "Feed subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, specifications: &[Specification]) -> Result<(), FeedError> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_reachable()?;

        let mut subscribed = self.subscribed.lock();
        for specification in specifications {
            subscribed.remove(specification);
        }
        tracing::debug!(feed = %self.name, count = specifications.len(), "Feed unsubscribed");
        Ok(())
    }
}

/// Drive `provider` from a feed's event channel until cancelled or the
/// channel closes.
pub async fn run_feed_handler(
    provider: SnapshotProvider,
    mut rx: mpsc::Receiver<FeedEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Feed handler cancelled");
                break;
            }
            event = rx.recv() => {
                let Some(event) = event else {
                    tracing::info!("Feed event channel closed");
                    break;
                };
                match event {
                    FeedEvent::Connected => provider.connect().await,
                    FeedEvent::Disconnected => provider.disconnect(),
                    FeedEvent::Tick {
                        specification,
                        fields,
                    } => provider.on_tick(&specification, &fields),
                }
            }
        }
    }
}
