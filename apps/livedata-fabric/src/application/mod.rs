//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the live data providers and the port interfaces
//! that define how they interact with upstream feeds and satellite
//! services.

/// Port interfaces for providers, feeds and satellite services.
pub mod ports;

/// Snapshot provider, combining provider and subscription join.
pub mod services;
