//! Specification Resolution Port (Driven Port)
//!
//! Normalizes a raw specification into the canonical one the upstream
//! feed publishes under.

use async_trait::async_trait;

use super::CollaboratorError;
use crate::domain::market_data::Specification;

/// Maps raw specifications to resolved ones.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpecificationResolver: Send + Sync {
    /// Resolve one specification.
    async fn resolve(&self, specification: &Specification)
    -> Result<Specification, CollaboratorError>;
}

/// Resolves every specification to itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver;

#[async_trait]
impl SpecificationResolver for IdentityResolver {
    async fn resolve(
        &self,
        specification: &Specification,
    ) -> Result<Specification, CollaboratorError> {
        Ok(specification.clone())
    }
}
