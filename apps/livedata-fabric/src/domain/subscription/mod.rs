//! Subscription Management Types
//!
//! Domain types for tracking which users hold which requirements and
//! where each requirement stands in its subscription lifecycle.
//!
//! # Design
//!
//! The subscription registry tracks:
//! - Which requirements each user is subscribed to
//! - Reference counting per requirement across users
//!
//! This allows several users to hold the same requirement while the
//! provider keeps one upstream subscription. The state table records the
//! `Unsubscribed → Pending → {Subscribed | Failed}` lifecycle per
//! requirement.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use parking_lot::RwLock;

use super::market_data::{Requirement, UserPrincipal};

// =============================================================================
// Subscription State
// =============================================================================

/// Lifecycle state of one logical subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SubscriptionState {
    /// Not subscribed.
    #[default]
    Unsubscribed,
    /// Request submitted, result not yet known.
    Pending,
    /// Upstream acknowledged the subscription.
    Subscribed,
    /// The subscription was refused or could not be established.
    Failed,
}

impl SubscriptionState {
    /// Whether this is a terminal state of a request.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Subscribed | Self::Failed)
    }

    /// State name for logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unsubscribed => "unsubscribed",
            Self::Pending => "pending",
            Self::Subscribed => "subscribed",
            Self::Failed => "failed",
        }
    }
}

/// Per-requirement lifecycle table.
///
/// Absent entries read as [`SubscriptionState::Unsubscribed`]. Re-entering
/// `Pending` from `Failed` is allowed. A request joining a requirement that
/// is already `Subscribed` leaves it `Subscribed`.
#[derive(Debug, Default)]
pub struct SubscriptionStates {
    states: DashMap<Requirement, SubscriptionState>,
}

impl SubscriptionStates {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `Pending` unless already `Subscribed`. Returns the previous state.
    pub fn begin(&self, requirement: &Requirement) -> SubscriptionState {
        let mut state = self
            .states
            .entry(requirement.clone())
            .or_insert(SubscriptionState::Unsubscribed);
        let previous = *state;
        if previous != SubscriptionState::Subscribed {
            *state = SubscriptionState::Pending;
        }
        previous
    }

    /// Record the terminal state of a request.
    ///
    /// Ignored when the requirement was reset while the request was in
    /// flight. Returns whether the state was recorded.
    pub fn complete(&self, requirement: &Requirement, succeeded: bool) -> bool {
        let Some(mut state) = self.states.get_mut(requirement) else {
            return false;
        };
        *state = if succeeded {
            SubscriptionState::Subscribed
        } else {
            SubscriptionState::Failed
        };
        true
    }

    /// Return a requirement to `Unsubscribed`.
    pub fn reset(&self, requirement: &Requirement) {
        self.states.remove(requirement);
    }

    /// Current state of a requirement.
    #[must_use]
    pub fn get(&self, requirement: &Requirement) -> SubscriptionState {
        self.states
            .get(requirement)
            .map(|state| *state)
            .unwrap_or_default()
    }
}

// =============================================================================
// Registry State
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    /// Map from user to their subscribed requirements.
    user_requirements: HashMap<UserPrincipal, HashSet<Requirement>>,
    /// Map from requirement to reference count.
    requirement_refcount: HashMap<Requirement, usize>,
}

impl RegistryState {
    fn add(&mut self, user: &UserPrincipal, requirement: &Requirement) -> RegistryChange {
        let user_set = self.user_requirements.entry(user.clone()).or_default();

        // Skip if user already subscribed
        if !user_set.insert(requirement.clone()) {
            return RegistryChange::Unchanged;
        }

        let refcount = self
            .requirement_refcount
            .entry(requirement.clone())
            .or_insert(0);
        *refcount += 1;

        if *refcount == 1 {
            RegistryChange::FirstReference
        } else {
            RegistryChange::AdditionalReference
        }
    }

    fn remove(&mut self, user: &UserPrincipal, requirement: &Requirement) -> RegistryChange {
        let Some(user_set) = self.user_requirements.get_mut(user) else {
            return RegistryChange::Unchanged;
        };

        if !user_set.remove(requirement) {
            return RegistryChange::Unchanged;
        }

        if user_set.is_empty() {
            self.user_requirements.remove(user);
        }

        self.release(requirement)
    }

    fn remove_user(&mut self, user: &UserPrincipal) -> Vec<Requirement> {
        let Some(user_set) = self.user_requirements.remove(user) else {
            return vec![];
        };

        user_set
            .into_iter()
            .filter(|requirement| self.release(requirement) == RegistryChange::LastReference)
            .collect()
    }

    fn remove_requirement(&mut self, requirement: &Requirement) -> Vec<UserPrincipal> {
        if self.requirement_refcount.remove(requirement).is_none() {
            return vec![];
        }

        let mut holders = Vec::new();
        self.user_requirements.retain(|user, set| {
            if set.remove(requirement) {
                holders.push(user.clone());
            }
            !set.is_empty()
        });
        holders
    }

    fn release(&mut self, requirement: &Requirement) -> RegistryChange {
        let Some(refcount) = self.requirement_refcount.get_mut(requirement) else {
            return RegistryChange::Unchanged;
        };

        *refcount = refcount.saturating_sub(1);
        if *refcount == 0 {
            self.requirement_refcount.remove(requirement);
            RegistryChange::LastReference
        } else {
            RegistryChange::ReleasedReference
        }
    }
}

/// Effect of a registry operation on a requirement's reference count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    /// The (user, requirement) pair was already present or absent.
    Unchanged,
    /// Refcount went 0→1.
    FirstReference,
    /// Refcount increased past 1.
    AdditionalReference,
    /// Refcount decreased but is still positive.
    ReleasedReference,
    /// Refcount went 1→0.
    LastReference,
}

impl RegistryChange {
    /// Whether the (user, requirement) pair was newly recorded.
    #[must_use]
    pub const fn is_new_pair(self) -> bool {
        matches!(self, Self::FirstReference | Self::AdditionalReference)
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Tracks requirement interest across users.
///
/// # Example
///
/// ```rust
/// use livedata_fabric::domain::market_data::{ExternalId, Requirement, UserPrincipal};
/// use livedata_fabric::domain::subscription::{RegistryChange, SubscriptionRegistry};
///
/// let registry = SubscriptionRegistry::new();
/// let req = Requirement::market_value(ExternalId::of("TICKER", "AAPL"));
/// let alice = UserPrincipal::local("alice");
/// let bob = UserPrincipal::local("bob");
///
/// assert_eq!(registry.add(&alice, &req), RegistryChange::FirstReference);
/// assert_eq!(registry.add(&bob, &req), RegistryChange::AdditionalReference);
/// assert_eq!(registry.add(&bob, &req), RegistryChange::Unchanged);
///
/// assert_eq!(registry.remove(&alice, &req), RegistryChange::ReleasedReference);
/// assert_eq!(registry.remove(&bob, &req), RegistryChange::LastReference);
/// assert!(!registry.is_active(&req));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `user` holds `requirement`.
    pub fn add(&self, user: &UserPrincipal, requirement: &Requirement) -> RegistryChange {
        self.state.write().add(user, requirement)
    }

    /// Record that `user` no longer holds `requirement`.
    pub fn remove(&self, user: &UserPrincipal, requirement: &Requirement) -> RegistryChange {
        self.state.write().remove(user, requirement)
    }

    /// Remove every requirement held by `user`.
    ///
    /// Returns the requirements no other user still holds.
    pub fn remove_user(&self, user: &UserPrincipal) -> Vec<Requirement> {
        self.state.write().remove_user(user)
    }

    /// Drop `requirement` for every user holding it.
    ///
    /// Returns the users that held it.
    pub fn remove_requirement(&self, requirement: &Requirement) -> Vec<UserPrincipal> {
        self.state.write().remove_requirement(requirement)
    }

    /// Whether any user holds `requirement`.
    #[must_use]
    pub fn is_active(&self, requirement: &Requirement) -> bool {
        self.state
            .read()
            .requirement_refcount
            .contains_key(requirement)
    }

    /// Whether `user` holds `requirement`.
    #[must_use]
    pub fn holds(&self, user: &UserPrincipal, requirement: &Requirement) -> bool {
        self.state
            .read()
            .user_requirements
            .get(user)
            .is_some_and(|set| set.contains(requirement))
    }

    /// All requirements held by at least one user.
    #[must_use]
    pub fn active_requirements(&self) -> Vec<Requirement> {
        self.state
            .read()
            .requirement_refcount
            .keys()
            .cloned()
            .collect()
    }

    /// Requirements held by one user.
    #[must_use]
    pub fn user_requirements(&self, user: &UserPrincipal) -> Vec<Requirement> {
        self.state
            .read()
            .user_requirements
            .get(user)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.read();
        RegistryStats {
            requirement_count: state.requirement_refcount.len(),
            user_count: state.user_requirements.len(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of distinct requirements held.
    pub requirement_count: usize,
    /// Number of users holding at least one requirement.
    pub user_count: usize,
}

// =============================================================================
// Tests
// =============================================================================
