//! Live Data Provider Port (Driver Port)
//!
//! The contract every provider exposes to consumers. A provider accepts
//! subscriptions asynchronously, captures immutable snapshots on demand and
//! answers point queries against retained snapshots.
//!
//! # Listener Model
//!
//! Each `add_subscription` call returns a [`SubscriptionTicket`] that
//! resolves to exactly one [`SubscriptionResult`] for that request. The
//! same outcome, and every value change, is also published as a
//! [`ProviderEvent`] on the provider's broadcast channel; `events()` hands
//! out a receiver.

use tokio::sync::{broadcast, oneshot};

use crate::domain::market_data::{Requirement, Specification, UserPrincipal, ValidationError};
use crate::domain::snapshot::SnapshotId;
use crate::domain::subscription::SubscriptionState;

// =============================================================================
// Errors
// =============================================================================

/// Errors rejected synchronously at the call site.
///
/// Feed, entitlement and resolution failures never appear here; they are
/// delivered through the subscription result instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiveDataError {
    /// The requirement is malformed.
    #[error("invalid requirement: {0}")]
    InvalidRequirement(ValidationError),

    /// A specification (or its normalization rule set) is malformed.
    #[error("invalid specification: {0}")]
    InvalidSpecification(ValidationError),

    /// The user principal is malformed.
    #[error("invalid user: {0}")]
    InvalidUser(ValidationError),

    /// A combining provider needs at least one constituent.
    #[error("a combining provider requires at least one constituent provider")]
    NoProviders,

    /// Providers spawn their completion tasks on the ambient Tokio runtime.
    #[error("no Tokio runtime available: {0}")]
    RuntimeUnavailable(String),
}

impl LiveDataError {
    /// Validate a subscription request's arguments.
    ///
    /// # Errors
    ///
    /// Returns `InvalidUser` or `InvalidRequirement`.
    pub fn check_request(user: &UserPrincipal, requirement: &Requirement) -> Result<(), Self> {
        user.validate().map_err(Self::InvalidUser)?;
        requirement.validate().map_err(Self::InvalidRequirement)
    }
}

// =============================================================================
// Subscription Results
// =============================================================================

/// Why a subscription did not succeed, and which provider refused it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{provider}: {reason}")]
pub struct SubscriptionFailure {
    /// Name of the provider that reported the failure.
    pub provider: String,
    /// Human-readable reason.
    pub reason: String,
}

impl SubscriptionFailure {
    /// Create a failure.
    #[must_use]
    pub fn new(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            reason: reason.into(),
        }
    }
}

/// Outcome of one logical subscription request.
pub type SubscriptionResult = Result<(), SubscriptionFailure>;

/// Handle on the outcome of one `add_subscription` call.
#[derive(Debug)]
pub struct SubscriptionTicket {
    provider: String,
    requirement: Requirement,
    rx: oneshot::Receiver<SubscriptionResult>,
}

impl SubscriptionTicket {
    /// Create a ticket and the sender that completes it.
    #[must_use]
    pub fn channel(
        provider: impl Into<String>,
        requirement: Requirement,
    ) -> (oneshot::Sender<SubscriptionResult>, Self) {
        let (tx, rx) = oneshot::channel();
        let ticket = Self {
            provider: provider.into(),
            requirement,
            rx,
        };
        (tx, ticket)
    }

    /// Provider that issued the ticket.
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Requirement the ticket belongs to.
    #[must_use]
    pub const fn requirement(&self) -> &Requirement {
        &self.requirement
    }

    /// Wait for the outcome.
    ///
    /// A request whose completion side was dropped resolves to a failure
    /// attributed to the issuing provider.
    pub async fn outcome(self) -> SubscriptionResult {
        let provider = self.provider;
        self.rx.await.unwrap_or_else(|_| {
            Err(SubscriptionFailure::new(
                provider,
                "subscription request abandoned before completion",
            ))
        })
    }
}

// =============================================================================
// Events
// =============================================================================

/// Notifications published to a provider's listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// A subscription request succeeded.
    SubscriptionSucceeded {
        /// Provider publishing the event.
        provider: String,
        /// The requirement subscribed.
        requirement: Requirement,
    },
    /// A subscription request failed.
    SubscriptionFailed {
        /// The requirement that could not be subscribed.
        requirement: Requirement,
        /// Failing provider and reason.
        failure: SubscriptionFailure,
    },
    /// The current value of a requirement changed.
    ValueChanged {
        /// Provider whose store changed.
        provider: String,
        /// The requirement whose value changed.
        requirement: Requirement,
    },
}

impl ProviderEvent {
    /// Requirement the event is about.
    #[must_use]
    pub const fn requirement(&self) -> &Requirement {
        match self {
            Self::SubscriptionSucceeded { requirement, .. }
            | Self::SubscriptionFailed { requirement, .. }
            | Self::ValueChanged { requirement, .. } => requirement,
        }
    }
}

// =============================================================================
// Provider Port
// =============================================================================

/// Subscribe, capture and query contract.
///
/// Implementations must be callable from any thread. `add_subscription`
/// returns as soon as the request is submitted; `snapshot` may briefly
/// wait on per-instrument locks; `query_snapshot` reads immutable
/// retained data only.
pub trait LiveDataProvider: Send + Sync {
    /// Identifying name, used as the source of subscription failures.
    fn name(&self) -> &str;

    /// Submit a subscription request for `requirement` on behalf of `user`.
    ///
    /// Idempotent per `(user, requirement)` pair.
    ///
    /// # Errors
    ///
    /// Returns `LiveDataError` when the arguments are malformed.
    fn add_subscription(
        &self,
        user: &UserPrincipal,
        requirement: &Requirement,
    ) -> Result<SubscriptionTicket, LiveDataError>;

    /// Withdraw `user`'s interest in `requirement`. Does not wait for upstream.
    fn remove_subscription(&self, user: &UserPrincipal, requirement: &Requirement);

    /// Capture current values and retain them under a fresh id.
    fn snapshot(&self) -> SnapshotId;

    /// Value retained for `(snapshot, requirement)`, if any.
    fn query_snapshot(&self, snapshot: SnapshotId, requirement: &Requirement) -> Option<f64>;

    /// Drop retention of a snapshot. Idempotent.
    fn release_snapshot(&self, snapshot: SnapshotId);

    /// Register a listener.
    fn events(&self) -> broadcast::Receiver<ProviderEvent>;

    /// Lifecycle state of a requirement.
    fn subscription_state(&self, requirement: &Requirement) -> SubscriptionState;

    /// Specifications currently of interest upstream.
    fn active_specifications(&self) -> Vec<Specification>;
}

// =============================================================================
// Tests
// =============================================================================
