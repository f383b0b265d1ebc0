//! Domain Layer - Core live data types and business logic.
//!
//! This layer contains the value types, the per-instrument field store,
//! the indicative value rule, snapshot retention and subscription
//! bookkeeping. Nothing here performs I/O.

/// Identifiers: specifications, requirements, users and field names.
pub mod market_data;

/// Per-specification field store and the indicative value rule.
pub mod field_store;

/// Immutable snapshots and their retention table.
pub mod snapshot;

/// Subscription tracking, reference counting and state machine.
pub mod subscription;
