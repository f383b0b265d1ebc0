//! Entitlement Adapters
//!
//! Entitlement checks over the request/response conduit, the server side
//! that answers them, and a local deny-list checker.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::application::ports::{CollaboratorError, EntitlementChecker};
use crate::domain::market_data::{Specification, UserPrincipal};
use crate::infrastructure::conduit::{self, ConduitError, RequestConduit, RequestHandler};

/// Entitlement question sent over the conduit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementRequest {
    /// Requesting user.
    pub user: UserPrincipal,
    /// Specification the user wants.
    pub specification: Specification,
}

/// Entitlement answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementResponse {
    /// Whether the user may subscribe.
    pub allowed: bool,
}

// =============================================================================
// Client
// =============================================================================

/// Asks a remote entitlement server.
pub struct RemoteEntitlementChecker {
    conduit: Arc<dyn RequestConduit>,
}

impl RemoteEntitlementChecker {
    /// Create a checker sending requests over `conduit`.
    #[must_use]
    pub fn new(conduit: Arc<dyn RequestConduit>) -> Self {
        Self { conduit }
    }
}

#[async_trait]
impl EntitlementChecker for RemoteEntitlementChecker {
    async fn is_entitled(
        &self,
        user: &UserPrincipal,
        specification: &Specification,
    ) -> Result<bool, CollaboratorError> {
        let request = EntitlementRequest {
            user: user.clone(),
            specification: specification.clone(),
        };
        let response: EntitlementResponse = conduit::call(self.conduit.as_ref(), &request).await?;
        tracing::debug!(
            user = %user,
            specification = %specification,
            allowed = response.allowed,
            "Remote entitlement answered"
        );
        Ok(response.allowed)
    }
}

// =============================================================================
// Server
// =============================================================================

/// Answers entitlement requests with a local checker.
pub struct EntitlementServer<C> {
    checker: C,
}

impl<C> EntitlementServer<C> {
    /// Serve answers from `checker`.
    pub const fn new(checker: C) -> Self {
        Self { checker }
    }
}

#[async_trait]
impl<C: EntitlementChecker + 'static> RequestHandler for EntitlementServer<C> {
    async fn handle(&self, payload: serde_json::Value) -> Result<serde_json::Value, ConduitError> {
        let request: EntitlementRequest = serde_json::from_value(payload)?;
        let allowed = self
            .checker
            .is_entitled(&request.user, &request.specification)
            .await
            .map_err(|e| ConduitError::Remote(e.to_string()))?;
        Ok(serde_json::to_value(EntitlementResponse { allowed })?)
    }
}

// =============================================================================
// Deny List
// =============================================================================

/// Entitles everything except listed users and specifications.
#[derive(Debug, Clone, Default)]
pub struct DenyListEntitlementChecker {
    denied_users: HashSet<String>,
    denied_specifications: HashSet<Specification>,
}

impl DenyListEntitlementChecker {
    /// Create a checker that denies nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deny every request from `user_name`.
    #[must_use]
    pub fn deny_user(mut self, user_name: impl Into<String>) -> Self {
        self.denied_users.insert(user_name.into());
        self
    }

    /// Deny every request for `specification`.
    #[must_use]
    pub fn deny_specification(mut self, specification: Specification) -> Self {
        self.denied_specifications.insert(specification);
        self
    }
}

#[async_trait]
impl EntitlementChecker for DenyListEntitlementChecker {
    async fn is_entitled(
        &self,
        user: &UserPrincipal,
        specification: &Specification,
    ) -> Result<bool, CollaboratorError> {
        Ok(!self.denied_users.contains(&user.user_name)
            && !self.denied_specifications.contains(specification))
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::application::ports::{MockEntitlementChecker, PermissiveEntitlementChecker};
    use crate::domain::market_data::ExternalId;
    use crate::infrastructure::conduit::InMemoryConduit;

    fn spec(ticker: &str) -> Specification {
        Specification::new("OpenGamma", ExternalId::of("TICKER", ticker))
    }

    #[tokio::test]
    async fn deny_list_blocks_listed_entries() {
        let checker = DenyListEntitlementChecker::new()
            .deny_user("mallory")
            .deny_specification(spec("SECRET"));

        let alice = UserPrincipal::local("alice");
        let mallory = UserPrincipal::local("mallory");

        assert_eq!(checker.is_entitled(&alice, &spec("AAPL")).await, Ok(true));
        assert_eq!(checker.is_entitled(&mallory, &spec("AAPL")).await, Ok(false));
        assert_eq!(checker.is_entitled(&alice, &spec("SECRET")).await, Ok(false));
    }

    #[tokio::test]
    async fn remote_checker_asks_server() {
        let server = EntitlementServer::new(DenyListEntitlementChecker::new().deny_user("mallory"));
        let (conduit, _task) = InMemoryConduit::serve(server, 8, CancellationToken::new());
        let checker = RemoteEntitlementChecker::new(Arc::new(conduit));

        let alice = UserPrincipal::local("alice");
        let mallory = UserPrincipal::local("mallory");
        assert_eq!(checker.is_entitled(&alice, &spec("AAPL")).await, Ok(true));
        assert_eq!(checker.is_entitled(&mallory, &spec("AAPL")).await, Ok(false));
    }

    #[tokio::test]
    async fn server_failure_surfaces_as_unavailable() {
        let mut failing = MockEntitlementChecker::new();
        failing
            .expect_is_entitled()
            .returning(|_, _| Err(CollaboratorError::Unavailable("database down".to_string())));
        let (conduit, _task) =
            InMemoryConduit::serve(EntitlementServer::new(failing), 8, CancellationToken::new());
        let checker = RemoteEntitlementChecker::new(Arc::new(conduit));

        let result = checker
            .is_entitled(&UserPrincipal::local("alice"), &spec("AAPL"))
            .await;
        assert!(matches!(result, Err(CollaboratorError::Unavailable(reason)) if reason.contains("database down")));
    }

    #[tokio::test]
    async fn closed_conduit_is_unavailable() {
        let cancel = CancellationToken::new();
        let (conduit, task) = InMemoryConduit::serve(
            EntitlementServer::new(PermissiveEntitlementChecker),
            8,
            cancel.clone(),
        );
        cancel.cancel();
        task.await.unwrap();

        let checker = RemoteEntitlementChecker::new(Arc::new(conduit));
        let result = checker
            .is_entitled(&UserPrincipal::local("alice"), &spec("AAPL"))
            .await;
        assert!(matches!(result, Err(CollaboratorError::Unavailable(_))));
    }
}
