//! Snapshot Provider Service
//!
//! Single-source live data provider. Owns one field store per subscribed
//! specification, merges upstream ticks into it and captures immutable
//! snapshots on demand.
//!
//! # Locking
//!
//! - Each field store sits behind its own mutex. Ticks and snapshot capture
//!   lock one store at a time, so unrelated instruments never contend.
//! - `topology` (async) serializes upstream subscribe/unsubscribe calls.
//! - `attach_lock` serializes attaching and detaching requirements to
//!   stores so a store is never removed while a requirement is joining it.
//! - Retained snapshots are immutable and read through the sharded
//!   snapshot table without any store lock.

use std::collections::{HashMap, HashSet};
use std::slice;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot};

use crate::application::ports::{
    EntitlementChecker, IdentityResolver, LiveDataError, LiveDataProvider, MarketDataFeed,
    PermissiveEntitlementChecker, ProviderEvent, SpecificationResolver, SubscriptionFailure,
    SubscriptionResult, SubscriptionTicket,
};
use crate::domain::field_store::FieldStore;
use crate::domain::market_data::{
    DEFAULT_NORMALIZATION_RULE_SET, FieldMap, Requirement, Specification, UserPrincipal,
    ValidationError,
};
use crate::domain::snapshot::{Snapshot, SnapshotId, SnapshotStore};
use crate::domain::subscription::{
    RegistryChange, SubscriptionRegistry, SubscriptionState, SubscriptionStates,
};
use crate::infrastructure::broadcast::{BroadcastConfig, EventHub};
use crate::infrastructure::metrics::{self, SubscriptionOutcome};

const FEED_DOWN: &str = "connection to market data feed down";
const WITHDRAWN: &str = "subscription withdrawn before completion";

// =============================================================================
// Status Types
// =============================================================================

/// Upstream connection status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Feed is connected.
    Connected,
    /// Feed is not connected.
    #[default]
    NotConnected,
}

impl ConnectionStatus {
    /// Status label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::NotConnected => "not_connected",
        }
    }
}

/// Point-in-time provider statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    /// Requirements held by at least one user.
    pub active_requirements: usize,
    /// Specifications with a live field store.
    pub active_specifications: usize,
    /// Snapshots retained and not yet released.
    pub retained_snapshots: usize,
    /// Ticks received from upstream.
    pub ticks_received: u64,
    /// Ticks dropped because nothing was subscribed to their specification.
    pub ticks_dropped: u64,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`SnapshotProvider`].
pub struct SnapshotProviderBuilder {
    name: String,
    feed: Arc<dyn MarketDataFeed>,
    entitlements: Arc<dyn EntitlementChecker>,
    resolver: Arc<dyn SpecificationResolver>,
    normalization_rule_set: String,
    broadcast: BroadcastConfig,
}

impl SnapshotProviderBuilder {
    /// Entitlement checker consulted before upstream subscription.
    #[must_use]
    pub fn entitlements(mut self, checker: Arc<dyn EntitlementChecker>) -> Self {
        self.entitlements = checker;
        self
    }

    /// Resolver applied to each requirement's raw specification.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn SpecificationResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Normalization rule set used to build raw specifications.
    #[must_use]
    pub fn normalization_rule_set(mut self, rule_set_id: impl Into<String>) -> Self {
        self.normalization_rule_set = rule_set_id.into();
        self
    }

    /// Event channel configuration.
    #[must_use]
    pub fn broadcast(mut self, config: BroadcastConfig) -> Self {
        self.broadcast = config;
        self
    }

    /// Build the provider on the current Tokio runtime.
    ///
    /// The provider starts `NotConnected`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpecification` for an empty rule set and
    /// `RuntimeUnavailable` outside a Tokio runtime.
    pub fn build(self) -> Result<SnapshotProvider, LiveDataError> {
        if self.normalization_rule_set.trim().is_empty() {
            return Err(LiveDataError::InvalidSpecification(ValidationError::Empty(
                "normalization rule set id",
            )));
        }
        let runtime =
            Handle::try_current().map_err(|e| LiveDataError::RuntimeUnavailable(e.to_string()))?;

        let inner = ProviderInner {
            name: self.name,
            normalization_rule_set: self.normalization_rule_set,
            feed: self.feed,
            entitlements: self.entitlements,
            resolver: self.resolver,
            registry: SubscriptionRegistry::new(),
            states: SubscriptionStates::new(),
            resolved: DashMap::new(),
            stores: DashMap::new(),
            snapshots: SnapshotStore::new(),
            events: EventHub::new(self.broadcast),
            connection: RwLock::new(ConnectionStatus::NotConnected),
            ticks_received: AtomicU64::new(0),
            ticks_dropped: AtomicU64::new(0),
            topology: tokio::sync::Mutex::new(()),
            attach_lock: Mutex::new(()),
            runtime,
        };

        Ok(SnapshotProvider {
            inner: Arc::new(inner),
        })
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Field store for one specification and the requirements reading it.
#[derive(Debug, Default)]
struct KeyedStore {
    fields: FieldStore,
    requirements: HashSet<Requirement>,
}

struct ProviderInner {
    name: String,
    normalization_rule_set: String,
    feed: Arc<dyn MarketDataFeed>,
    entitlements: Arc<dyn EntitlementChecker>,
    resolver: Arc<dyn SpecificationResolver>,
    registry: SubscriptionRegistry,
    states: SubscriptionStates,
    /// Requirement to the specification its store is keyed by.
    resolved: DashMap<Requirement, Specification>,
    stores: DashMap<Specification, Arc<Mutex<KeyedStore>>>,
    snapshots: SnapshotStore<Snapshot>,
    events: EventHub,
    connection: RwLock<ConnectionStatus>,
    ticks_received: AtomicU64,
    ticks_dropped: AtomicU64,
    topology: tokio::sync::Mutex<()>,
    attach_lock: Mutex<()>,
    runtime: Handle,
}

/// Single-source snapshot provider.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SnapshotProvider {
    inner: Arc<ProviderInner>,
}

impl std::fmt::Debug for SnapshotProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotProvider")
            .field("name", &self.inner.name)
            .field("connection", &self.connection_status())
            .finish_non_exhaustive()
    }
}

impl SnapshotProvider {
    /// Start building a provider fed by `feed`.
    ///
    /// Defaults: permissive entitlements, identity resolution, the
    /// `OpenGamma` rule set and the default event capacity.
    #[must_use]
    pub fn builder(name: impl Into<String>, feed: Arc<dyn MarketDataFeed>) -> SnapshotProviderBuilder {
        SnapshotProviderBuilder {
            name: name.into(),
            feed,
            entitlements: Arc::new(PermissiveEntitlementChecker),
            resolver: Arc::new(IdentityResolver),
            normalization_rule_set: DEFAULT_NORMALIZATION_RULE_SET.to_string(),
            broadcast: BroadcastConfig::default(),
        }
    }

    /// Mark the feed connected and re-establish upstream subscriptions.
    ///
    /// Re-subscription failures are logged, not returned.
    pub async fn connect(&self) {
        *self.inner.connection.write() = ConnectionStatus::Connected;
        tracing::info!(provider = %self.inner.name, "Market data feed connected");
        self.inner.resubscribe_all().await;
    }

    /// Mark the feed disconnected. Field stores are kept.
    pub fn disconnect(&self) {
        *self.inner.connection.write() = ConnectionStatus::NotConnected;
        tracing::warn!(provider = %self.inner.name, "Market data feed disconnected");
    }

    /// Current connection status.
    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        *self.inner.connection.read()
    }

    /// Merge one tick into the store for `specification`.
    ///
    /// Ticks for specifications nobody subscribed are dropped.
    pub fn on_tick(&self, specification: &Specification, fields: &FieldMap) {
        self.inner.on_tick(specification, fields);
    }

    /// Merge a single field update.
    pub fn on_field_update(&self, specification: &Specification, field: &str, value: f64) {
        let fields = FieldMap::from([(field.to_string(), value)]);
        self.inner.on_tick(specification, &fields);
    }

    /// Remove every requirement held by `user`.
    pub fn remove_user(&self, user: &UserPrincipal) {
        for requirement in self.inner.registry.remove_user(user) {
            self.inner.release_requirement(&requirement);
        }
    }

    /// Drop every requirement reading `specification` and tear down its
    /// upstream subscription.
    ///
    /// Called when the specification's heartbeat lease runs out. Returns the
    /// requirements that were dropped.
    pub async fn expire_specification(&self, specification: &Specification) -> Vec<Requirement> {
        let requirements: Vec<Requirement> = self
            .inner
            .store(specification)
            .map(|store| store.lock().requirements.iter().cloned().collect())
            .unwrap_or_default();

        for requirement in &requirements {
            let holders = self.inner.registry.remove_requirement(requirement);
            self.inner.states.reset(requirement);
            {
                let _attach = self.inner.attach_lock.lock();
                self.inner.detach(requirement);
            }
            tracing::info!(
                provider = %self.inner.name,
                requirement = %requirement,
                holders = holders.len(),
                "Subscription expired"
            );
        }

        self.inner.unsubscribe_upstream(specification).await;
        requirements
    }

    /// Whether the requirement is attached to a live field store.
    #[must_use]
    pub fn is_subscribed(&self, requirement: &Requirement) -> bool {
        self.inner.resolved.contains_key(requirement)
    }

    /// Current value of a subscribed requirement, outside any snapshot.
    #[must_use]
    pub fn current_value(&self, requirement: &Requirement) -> Option<f64> {
        let specification = self.inner.resolved.get(requirement)?.value().clone();
        let store = self.inner.store(&specification)?;
        let store = store.lock();
        store.fields.value_for(&requirement.value_name)
    }

    /// Provider statistics.
    #[must_use]
    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            active_requirements: self.inner.registry.stats().requirement_count,
            active_specifications: self.inner.stores.len(),
            retained_snapshots: self.inner.snapshots.len(),
            ticks_received: self.inner.ticks_received.load(Ordering::Relaxed),
            ticks_dropped: self.inner.ticks_dropped.load(Ordering::Relaxed),
        }
    }

    /// Normalization rule set used for raw specifications.
    #[must_use]
    pub fn normalization_rule_set(&self) -> &str {
        &self.inner.normalization_rule_set
    }
}

impl LiveDataProvider for SnapshotProvider {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn add_subscription(
        &self,
        user: &UserPrincipal,
        requirement: &Requirement,
    ) -> Result<SubscriptionTicket, LiveDataError> {
        LiveDataError::check_request(user, requirement)?;

        let change = self.inner.registry.add(user, requirement);
        self.inner.states.begin(requirement);
        let (tx, ticket) = SubscriptionTicket::channel(&self.inner.name, requirement.clone());

        tracing::debug!(
            provider = %self.inner.name,
            user = %user,
            requirement = %requirement,
            change = ?change,
            "Subscription requested"
        );

        let inner = Arc::clone(&self.inner);
        let user = user.clone();
        let requirement = requirement.clone();
        self.inner.runtime.spawn(async move {
            let result = inner.establish(&user, &requirement).await;
            if result.is_err() && change.is_new_pair() {
                inner.forget(&user, &requirement);
            }
            inner.deliver(&requirement, tx, result);
        });

        Ok(ticket)
    }

    fn remove_subscription(&self, user: &UserPrincipal, requirement: &Requirement) {
        match self.inner.registry.remove(user, requirement) {
            RegistryChange::LastReference => self.inner.release_requirement(requirement),
            RegistryChange::ReleasedReference => {
                tracing::debug!(
                    provider = %self.inner.name,
                    requirement = %requirement,
                    "Requirement still held by other users"
                );
            }
            _ => {
                tracing::debug!(
                    provider = %self.inner.name,
                    user = %user,
                    requirement = %requirement,
                    "Remove for a requirement the user does not hold"
                );
            }
        }
    }

    fn snapshot(&self) -> SnapshotId {
        self.inner.capture()
    }

    fn query_snapshot(&self, snapshot: SnapshotId, requirement: &Requirement) -> Option<f64> {
        self.inner.snapshots.value(snapshot, requirement)
    }

    fn release_snapshot(&self, snapshot: SnapshotId) {
        if self.inner.snapshots.release(snapshot).is_some() {
            metrics::record_snapshot_released(&self.inner.name, self.inner.snapshots.len());
            tracing::debug!(provider = %self.inner.name, snapshot = %snapshot, "Snapshot released");
        }
    }

    fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.inner.events.subscribe()
    }

    fn subscription_state(&self, requirement: &Requirement) -> SubscriptionState {
        self.inner.states.get(requirement)
    }

    fn active_specifications(&self) -> Vec<Specification> {
        self.inner
            .stores
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

// =============================================================================
// Internals
// =============================================================================

impl ProviderInner {
    fn failure(&self, reason: impl Into<String>) -> SubscriptionFailure {
        SubscriptionFailure::new(&self.name, reason)
    }

    fn is_connected(&self) -> bool {
        *self.connection.read() == ConnectionStatus::Connected
    }

    fn store(&self, specification: &Specification) -> Option<Arc<Mutex<KeyedStore>>> {
        self.stores
            .get(specification)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Resolve, check entitlement, attach, and subscribe upstream if this
    /// is the first requirement on its specification.
    async fn establish(&self, user: &UserPrincipal, requirement: &Requirement) -> SubscriptionResult {
        if !self.is_connected() {
            return Err(self.failure(FEED_DOWN));
        }

        let raw = requirement.specification(&self.normalization_rule_set);
        let specification = self
            .resolver
            .resolve(&raw)
            .await
            .map_err(|e| self.failure(e.to_string()))?;

        let entitled = self
            .entitlements
            .is_entitled(user, &specification)
            .await
            .map_err(|e| self.failure(e.to_string()))?;
        if !entitled {
            return Err(self.failure(format!(
                "user {user} is not entitled to {specification}"
            )));
        }

        let _topology = self.topology.lock().await;

        let needs_upstream = {
            let _attach = self.attach_lock.lock();
            if !self.registry.is_active(requirement) {
                return Err(self.failure(WITHDRAWN));
            }
            self.attach(requirement, &specification)
        };
        if !needs_upstream {
            return Ok(());
        }

        if let Err(e) = self.feed.subscribe(slice::from_ref(&specification)).await {
            let _attach = self.attach_lock.lock();
            self.detach(requirement);
            return Err(self.failure(e.to_string()));
        }
        metrics::set_active_specifications(&self.name, self.stores.len());

        if self.resolved.contains_key(requirement) {
            Ok(())
        } else {
            Err(self.failure(WITHDRAWN))
        }
    }

    /// Attach a requirement to the store for `specification`, creating it.
    /// Returns whether the store was created. Caller holds `attach_lock`.
    fn attach(&self, requirement: &Requirement, specification: &Specification) -> bool {
        self.resolved
            .insert(requirement.clone(), specification.clone());

        if let Some(store) = self.store(specification) {
            store.lock().requirements.insert(requirement.clone());
            return false;
        }

        let store = KeyedStore {
            fields: FieldStore::new(),
            requirements: HashSet::from([requirement.clone()]),
        };
        self.stores
            .insert(specification.clone(), Arc::new(Mutex::new(store)));
        true
    }

    /// Detach a requirement from its store, removing the store once empty.
    /// Returns the specification whose store was removed. Caller holds
    /// `attach_lock`.
    fn detach(&self, requirement: &Requirement) -> Option<Specification> {
        let (_, specification) = self.resolved.remove(requirement)?;
        if let Some(store) = self.store(&specification) {
            store.lock().requirements.remove(requirement);
        }
        self.stores
            .remove_if(&specification, |_, store| store.lock().requirements.is_empty())
            .map(|(specification, _)| specification)
    }

    /// Drop a failed request's registry entry.
    fn forget(&self, user: &UserPrincipal, requirement: &Requirement) {
        if self.registry.remove(user, requirement) == RegistryChange::LastReference {
            let _attach = self.attach_lock.lock();
            self.detach(requirement);
        }
    }

    fn release_requirement(self: &Arc<Self>, requirement: &Requirement) {
        self.states.reset(requirement);
        let orphaned = {
            let _attach = self.attach_lock.lock();
            self.detach(requirement)
        };
        tracing::info!(provider = %self.name, requirement = %requirement, "Subscription removed");

        if let Some(specification) = orphaned {
            let inner = Arc::clone(self);
            self.runtime.spawn(async move {
                inner.unsubscribe_upstream(&specification).await;
            });
        }
    }

    async fn unsubscribe_upstream(&self, specification: &Specification) {
        let _topology = self.topology.lock().await;
        if self.stores.contains_key(specification) {
            tracing::debug!(
                provider = %self.name,
                specification = %specification,
                "Specification re-subscribed before upstream teardown"
            );
            return;
        }

        match self.feed.unsubscribe(slice::from_ref(specification)).await {
            Ok(()) => tracing::info!(
                provider = %self.name,
                specification = %specification,
                "Unsubscribed upstream"
            ),
            Err(e) => tracing::warn!(
                provider = %self.name,
                specification = %specification,
                error = %e,
                "Upstream unsubscribe failed"
            ),
        }
        metrics::set_active_specifications(&self.name, self.stores.len());
    }

    async fn resubscribe_all(&self) {
        let _topology = self.topology.lock().await;
        let specifications: Vec<Specification> =
            self.stores.iter().map(|entry| entry.key().clone()).collect();
        if specifications.is_empty() {
            return;
        }

        match self.feed.subscribe(&specifications).await {
            Ok(()) => tracing::info!(
                provider = %self.name,
                count = specifications.len(),
                "Re-established upstream subscriptions"
            ),
            Err(e) => tracing::error!(
                provider = %self.name,
                count = specifications.len(),
                error = %e,
                "Failed to re-establish upstream subscriptions"
            ),
        }
    }

    fn deliver(
        &self,
        requirement: &Requirement,
        tx: oneshot::Sender<SubscriptionResult>,
        result: SubscriptionResult,
    ) {
        // A refused request leaves a requirement other users still read from live.
        let live = self.resolved.contains_key(requirement);
        self.states.complete(requirement, result.is_ok() || live);

        let event = match &result {
            Ok(()) => {
                tracing::info!(provider = %self.name, requirement = %requirement, "Subscription succeeded");
                metrics::record_subscription_result(&self.name, SubscriptionOutcome::Succeeded);
                ProviderEvent::SubscriptionSucceeded {
                    provider: self.name.clone(),
                    requirement: requirement.clone(),
                }
            }
            Err(failure) => {
                tracing::warn!(
                    provider = %self.name,
                    requirement = %requirement,
                    reason = %failure.reason,
                    "Subscription failed"
                );
                metrics::record_subscription_result(&self.name, SubscriptionOutcome::Failed);
                ProviderEvent::SubscriptionFailed {
                    requirement: requirement.clone(),
                    failure: failure.clone(),
                }
            }
        };

        self.events.publish(event);
        if tx.send(result).is_err() {
            tracing::debug!(requirement = %requirement, "Subscription ticket dropped before delivery");
        }
    }

    fn on_tick(&self, specification: &Specification, fields: &FieldMap) {
        self.ticks_received.fetch_add(1, Ordering::Relaxed);
        metrics::record_tick_received(&self.name);

        let Some(store) = self.store(specification) else {
            self.ticks_dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_tick_dropped(&self.name);
            tracing::trace!(
                provider = %self.name,
                specification = %specification,
                "Dropping tick for unsubscribed specification"
            );
            return;
        };

        let changed: Vec<Requirement> = {
            let mut store = store.lock();
            let before: Vec<(Requirement, Option<f64>)> = store
                .requirements
                .iter()
                .map(|r| (r.clone(), store.fields.value_for(&r.value_name)))
                .collect();

            store.fields.merge(fields);

            before
                .into_iter()
                .filter(|(r, old)| store.fields.value_for(&r.value_name) != *old)
                .map(|(r, _)| r)
                .collect()
        };

        for requirement in changed {
            self.events.publish(ProviderEvent::ValueChanged {
                provider: self.name.clone(),
                requirement,
            });
        }
    }

    fn capture(&self) -> SnapshotId {
        let stores: Vec<Arc<Mutex<KeyedStore>>> = self
            .stores
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut values = HashMap::new();
        for store in stores {
            let store = store.lock();
            for requirement in &store.requirements {
                if let Some(value) = store.fields.value_for(&requirement.value_name) {
                    values.insert(requirement.clone(), value);
                }
            }
        }

        let captured = values.len();
        let id = self
            .snapshots
            .insert_with(|id| Snapshot::new(id, Utc::now(), values));

        metrics::record_snapshot_taken(&self.name, self.snapshots.len());
        tracing::debug!(provider = %self.name, snapshot = %id, values = captured, "Snapshot taken");
        id
    }
}

// =============================================================================
// Tests
// =============================================================================
