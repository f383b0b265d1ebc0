//! Combining Provider Service
//!
//! Presents an ordered list of constituent providers as one provider.
//! Subscriptions fan out to every constituent and their outcomes are
//! joined into one result. Snapshots are correlated through an opaque id
//! mapping to each constituent's own snapshot id, and queries resolve by
//! constituent priority (list order): the first constituent with a value
//! wins and later constituents are not consulted.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};
use tokio::task::AbortHandle;

use super::subscription_join::SubscriptionJoin;
use crate::application::ports::{
    LiveDataError, LiveDataProvider, ProviderEvent, SubscriptionFailure, SubscriptionResult,
    SubscriptionTicket,
};
use crate::domain::market_data::{Requirement, Specification, UserPrincipal};
use crate::domain::snapshot::{SnapshotId, SnapshotStore};
use crate::domain::subscription::{SubscriptionState, SubscriptionStates};
use crate::infrastructure::broadcast::{BroadcastConfig, EventHub};
use crate::infrastructure::metrics::{self, SubscriptionOutcome};

/// Bookkeeping for one in-flight logical subscription request.
struct PendingSubscription {
    provider: String,
    requirement: Requirement,
    join: SubscriptionJoin,
    constituents: Vec<Arc<dyn LiveDataProvider>>,
    states: Arc<SubscriptionStates>,
    events: EventHub,
    tx: Mutex<Option<oneshot::Sender<SubscriptionResult>>>,
}

impl PendingSubscription {
    fn record(&self, constituent: &str, outcome: SubscriptionResult) {
        if let Some(result) = self.join.record(constituent, outcome) {
            self.deliver(result);
        }
    }

    fn deliver(&self, result: SubscriptionResult) {
        let live = held_by_all(&self.constituents, &self.requirement);
        self.states.complete(&self.requirement, result.is_ok() || live);

        let event = match &result {
            Ok(()) => {
                tracing::info!(
                    provider = %self.provider,
                    requirement = %self.requirement,
                    "Combined subscription succeeded"
                );
                metrics::record_subscription_result(&self.provider, SubscriptionOutcome::Succeeded);
                ProviderEvent::SubscriptionSucceeded {
                    provider: self.provider.clone(),
                    requirement: self.requirement.clone(),
                }
            }
            Err(failure) => {
                tracing::warn!(
                    provider = %self.provider,
                    requirement = %self.requirement,
                    constituent = %failure.provider,
                    reason = %failure.reason,
                    "Combined subscription failed"
                );
                metrics::record_subscription_result(&self.provider, SubscriptionOutcome::Failed);
                ProviderEvent::SubscriptionFailed {
                    requirement: self.requirement.clone(),
                    failure: failure.clone(),
                }
            }
        };
        self.events.publish(event);

        if let Some(tx) = self.tx.lock().take()
            && tx.send(result).is_err()
        {
            tracing::debug!(
                provider = %self.provider,
                requirement = %self.requirement,
                "Subscription ticket dropped before delivery"
            );
        }
    }
}

/// Whether every constituent holds a live subscription to `requirement`.
fn held_by_all(constituents: &[Arc<dyn LiveDataProvider>], requirement: &Requirement) -> bool {
    constituents
        .iter()
        .all(|p| p.subscription_state(requirement) == SubscriptionState::Subscribed)
}

/// Fan-out/join wrapper over N ≥ 1 constituent providers.
pub struct CombiningProvider {
    name: String,
    providers: Vec<Arc<dyn LiveDataProvider>>,
    states: Arc<SubscriptionStates>,
    snapshots: SnapshotStore<Vec<SnapshotId>>,
    events: EventHub,
    forwarders: Vec<AbortHandle>,
    runtime: Handle,
}

impl std::fmt::Debug for CombiningProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let constituents: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("CombiningProvider")
            .field("name", &self.name)
            .field("constituents", &constituents)
            .finish_non_exhaustive()
    }
}

impl CombiningProvider {
    /// Combine `providers`, in priority order.
    ///
    /// Spawns one task per constituent forwarding its value changes.
    ///
    /// # Errors
    ///
    /// Returns `NoProviders` for an empty list and `RuntimeUnavailable`
    /// outside a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        providers: Vec<Arc<dyn LiveDataProvider>>,
        broadcast: BroadcastConfig,
    ) -> Result<Self, LiveDataError> {
        if providers.is_empty() {
            return Err(LiveDataError::NoProviders);
        }
        let runtime =
            Handle::try_current().map_err(|e| LiveDataError::RuntimeUnavailable(e.to_string()))?;

        let name = name.into();
        let events = EventHub::new(broadcast);
        let forwarders = providers
            .iter()
            .map(|provider| spawn_forwarder(&runtime, &name, provider.as_ref(), events.clone()))
            .collect();

        tracing::info!(
            provider = %name,
            constituents = providers.len(),
            "Combining provider created"
        );

        Ok(Self {
            name,
            providers,
            states: Arc::new(SubscriptionStates::new()),
            snapshots: SnapshotStore::new(),
            events,
            forwarders,
            runtime,
        })
    }

    /// Constituent providers in priority order.
    #[must_use]
    pub fn constituents(&self) -> &[Arc<dyn LiveDataProvider>] {
        &self.providers
    }

    /// Combined snapshots currently retained.
    #[must_use]
    pub fn retained_snapshots(&self) -> usize {
        self.snapshots.len()
    }
}

impl Drop for CombiningProvider {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}

/// Re-publish a constituent's value changes on the combined channel.
fn spawn_forwarder(
    runtime: &Handle,
    combined: &str,
    provider: &dyn LiveDataProvider,
    events: EventHub,
) -> AbortHandle {
    let mut rx = provider.events();
    let combined = combined.to_string();
    let constituent = provider.name().to_string();

    runtime
        .spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event @ ProviderEvent::ValueChanged { .. }) => {
                        events.publish(event);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            provider = %combined,
                            constituent = %constituent,
                            skipped = n,
                            "Value change forwarder lagged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!(
                            provider = %combined,
                            constituent = %constituent,
                            "Constituent event channel closed"
                        );
                        break;
                    }
                }
            }
        })
        .abort_handle()
}

impl LiveDataProvider for CombiningProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn add_subscription(
        &self,
        user: &UserPrincipal,
        requirement: &Requirement,
    ) -> Result<SubscriptionTicket, LiveDataError> {
        LiveDataError::check_request(user, requirement)?;

        self.states.begin(requirement);
        let (tx, ticket) = SubscriptionTicket::channel(&self.name, requirement.clone());
        let pending = Arc::new(PendingSubscription {
            provider: self.name.clone(),
            requirement: requirement.clone(),
            join: SubscriptionJoin::new(self.providers.len()),
            constituents: self.providers.clone(),
            states: Arc::clone(&self.states),
            events: self.events.clone(),
            tx: Mutex::new(Some(tx)),
        });

        for provider in &self.providers {
            let constituent = provider.name().to_string();
            match provider.add_subscription(user, requirement) {
                Ok(submitted) => {
                    let pending = Arc::clone(&pending);
                    self.runtime.spawn(async move {
                        let outcome = submitted.outcome().await;
                        pending.record(&constituent, outcome);
                    });
                }
                Err(e) => {
                    pending.record(
                        &constituent,
                        Err(SubscriptionFailure::new(&constituent, e.to_string())),
                    );
                }
            }
        }

        Ok(ticket)
    }

    fn remove_subscription(&self, user: &UserPrincipal, requirement: &Requirement) {
        for provider in &self.providers {
            provider.remove_subscription(user, requirement);
        }
        if !held_by_all(&self.providers, requirement) {
            self.states.reset(requirement);
        }
    }

    fn snapshot(&self) -> SnapshotId {
        let constituent_ids: Vec<SnapshotId> =
            self.providers.iter().map(|p| p.snapshot()).collect();
        let id = self.snapshots.insert_with(|_| constituent_ids);
        metrics::record_snapshot_taken(&self.name, self.snapshots.len());
        id
    }

    fn query_snapshot(&self, snapshot: SnapshotId, requirement: &Requirement) -> Option<f64> {
        let constituent_ids = self.snapshots.get(snapshot)?;
        self.providers
            .iter()
            .zip(constituent_ids.iter())
            .find_map(|(provider, id)| provider.query_snapshot(*id, requirement))
    }

    fn release_snapshot(&self, snapshot: SnapshotId) {
        let Some(constituent_ids) = self.snapshots.release(snapshot) else {
            return;
        };
        for (provider, id) in self.providers.iter().zip(constituent_ids.iter()) {
            provider.release_snapshot(*id);
        }
        metrics::record_snapshot_released(&self.name, self.snapshots.len());
    }

    fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    fn subscription_state(&self, requirement: &Requirement) -> SubscriptionState {
        self.states.get(requirement)
    }

    fn active_specifications(&self) -> Vec<Specification> {
        let mut seen = HashSet::new();
        self.providers
            .iter()
            .flat_map(|p| p.active_specifications())
            .filter(|spec| seen.insert(spec.clone()))
            .collect()
    }
}
