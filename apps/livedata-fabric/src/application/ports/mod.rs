//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driver Ports (Inbound)
//!
//! - `LiveDataProvider`: subscribe, snapshot and query contract shared by
//!   single-source and combining providers
//!
//! ## Driven Ports (Outbound)
//!
//! - `MarketDataFeed`: upstream subscribe/unsubscribe
//! - `EntitlementChecker`: may a user see a specification
//! - `SpecificationResolver`: normalize a raw specification

mod entitlement_port;
mod feed_port;
mod provider_port;
mod resolution_port;

pub use entitlement_port::{CollaboratorError, EntitlementChecker, PermissiveEntitlementChecker};
pub use feed_port::{FeedError, MarketDataFeed};
pub use provider_port::{
    LiveDataError, LiveDataProvider, ProviderEvent, SubscriptionFailure, SubscriptionResult,
    SubscriptionTicket,
};
pub use resolution_port::{IdentityResolver, SpecificationResolver};

#[cfg(test)]
pub use entitlement_port::MockEntitlementChecker;
#[cfg(test)]
pub use feed_port::MockMarketDataFeed;
#[cfg(test)]
pub use resolution_port::MockSpecificationResolver;
