//! Entitlement Port (Driven Port)
//!
//! Gate consulted before a subscription reaches upstream. A denial is not
//! an error: it surfaces as a failed subscription.

use async_trait::async_trait;

use crate::domain::market_data::{Specification, UserPrincipal};

/// Failure talking to a satellite service (entitlement or resolution).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// The specification cannot be resolved.
    #[error("unable to resolve specification {0}")]
    Unresolvable(Specification),

    /// The remote service could not be reached or failed.
    #[error("remote service unavailable: {0}")]
    Unavailable(String),

    /// The remote service answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Decides whether a user may subscribe to a specification.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntitlementChecker: Send + Sync {
    /// Whether `user` is entitled to `specification`.
    async fn is_entitled(
        &self,
        user: &UserPrincipal,
        specification: &Specification,
    ) -> Result<bool, CollaboratorError>;
}

/// Entitles everyone to everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveEntitlementChecker;

#[async_trait]
impl EntitlementChecker for PermissiveEntitlementChecker {
    async fn is_entitled(
        &self,
        _user: &UserPrincipal,
        _specification: &Specification,
    ) -> Result<bool, CollaboratorError> {
        Ok(true)
    }
}
