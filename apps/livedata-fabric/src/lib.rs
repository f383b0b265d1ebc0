#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Live Data Fabric - Snapshot and Subscription Combination
//!
//! Distributes continuously updating market data ticks to many consumers
//! while giving every computation a consistent point-in-time view through
//! immutable snapshots. Several upstream providers can be combined behind
//! one provider with priority-ordered reads.
//!
//! # Layers (inside to outside)
//!
//! - **Domain**: identifiers, field stores, snapshots, subscription state
//!   - `market_data`: `Specification`, `Requirement`, `UserPrincipal`
//!   - `field_store`: merged tick fields and the indicative value rule
//!   - `snapshot`: immutable snapshots and their retention table
//!   - `subscription`: reference counting and the lifecycle state machine
//!
//! - **Application**: the provider contract and its implementations
//!   - `ports`: `LiveDataProvider`, `MarketDataFeed`, entitlement, resolution
//!   - `services`: `SnapshotProvider`, `CombiningProvider`, `SubscriptionJoin`
//!
//! - **Infrastructure**: adapters and ambient plumbing
//!   - `conduit`, `entitlement`, `resolution`: satellite request/response
//!   - `heartbeat`: liveness leases on upstream publication
//!   - `feed`: in-memory feed and the feed event handler
//!   - `config`, `telemetry`, `metrics`, `health`
//!
//! # Data Flow
//!
//! ```text
//! feed A ──► SnapshotProvider A ──┐
//!                                 ├──► CombiningProvider ──► consumers
//! feed B ──► SnapshotProvider B ──┘       (join, priority reads)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core live data types with no I/O.
pub mod domain;

/// Application layer - Provider contract and services.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market_data::{ExternalId, FieldMap, Requirement, Specification, UserPrincipal};
pub use domain::snapshot::SnapshotId;
pub use domain::subscription::SubscriptionState;

// Application
pub use application::ports::{
    LiveDataError, LiveDataProvider, ProviderEvent, SubscriptionFailure, SubscriptionResult,
    SubscriptionTicket,
};
pub use application::services::{
    CombiningProvider, ConnectionStatus, ProviderStats, SnapshotProvider,
};

// Infrastructure config
pub use infrastructure::config::{
    BroadcastSettings, ConfigError, FabricConfig, HeartbeatSettings, ServerSettings,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Broadcast hub
pub use infrastructure::broadcast::{BroadcastConfig, EventHub};

// Satellite protocols
pub use infrastructure::conduit::{ConduitError, InMemoryConduit};
pub use infrastructure::heartbeat::{
    HeartbeatConfig, HeartbeatEvent, HeartbeatMessage, HeartbeatReceiver, HeartbeatSender,
};

// Feed adapter
pub use infrastructure::feed::{FeedEvent, InMemoryFeed, run_feed_handler};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
