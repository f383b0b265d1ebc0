//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the service's ambient plumbing.

/// Broadcast channel adapter for provider events.
pub mod broadcast;

/// Request/response conduit for satellite protocols.
pub mod conduit;

/// Remote and local entitlement checkers.
pub mod entitlement;

/// Remote and local specification resolvers.
pub mod resolution;

/// Heartbeat sender, receiver and lease table.
pub mod heartbeat;

/// In-memory upstream feed and feed event handler.
pub mod feed;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// OpenTelemetry tracing integration.
pub mod telemetry;
