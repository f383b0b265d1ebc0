//! Market Data Feed Port (Driven Port)
//!
//! Interface to an upstream source of ticks. Ticks themselves flow back
//! into the provider through its ingestion hook; this port only manages
//! which specifications the upstream publishes.

use async_trait::async_trait;

use crate::domain::market_data::Specification;

/// Upstream feed error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// The feed cannot be reached.
    #[error("market data feed unreachable: {0}")]
    Unreachable(String),

    /// The feed does not publish this instrument.
    #[error("unknown instrument: {0}")]
    UnknownInstrument(Specification),

    /// The feed refused the request.
    #[error("feed rejected request: {0}")]
    Rejected(String),
}

/// Upstream subscribe/unsubscribe operations.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    /// Start publishing the given specifications.
    async fn subscribe(&self, specifications: &[Specification]) -> Result<(), FeedError>;

    /// Stop publishing the given specifications.
    async fn unsubscribe(&self, specifications: &[Specification]) -> Result<(), FeedError>;
}
