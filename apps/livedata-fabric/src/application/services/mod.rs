//! Application Services
//!
//! Services that implement the provider contract on top of the domain.
//!
//! - `SnapshotProvider`: single-source provider owning the field stores
//! - `CombiningProvider`: fan-out/join over N providers, priority reads
//! - `SubscriptionJoin`: the N-way outcome join used by the combiner

mod combining_provider;
mod snapshot_provider;
mod subscription_join;

pub use combining_provider::CombiningProvider;
pub use snapshot_provider::{
    ConnectionStatus, ProviderStats, SnapshotProvider, SnapshotProviderBuilder,
};
pub use subscription_join::SubscriptionJoin;
