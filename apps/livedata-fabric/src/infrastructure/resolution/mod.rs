//! Specification Resolution Adapters
//!
//! Resolution over the request/response conduit, the server side that
//! answers it, and a local table-driven resolver.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::application::ports::{CollaboratorError, SpecificationResolver};
use crate::domain::market_data::Specification;
use crate::infrastructure::conduit::{self, ConduitError, RequestConduit, RequestHandler};

/// Resolution question sent over the conduit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRequest {
    /// Raw specification.
    pub specification: Specification,
}

/// Resolution answer. `None` when the server cannot resolve the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionResponse {
    /// Canonical specification.
    pub resolved_specification: Option<Specification>,
}

/// Resolves through a remote resolution server.
pub struct RemoteSpecificationResolver {
    conduit: Arc<dyn RequestConduit>,
}

impl RemoteSpecificationResolver {
    /// Create a resolver sending requests over `conduit`.
    #[must_use]
    pub fn new(conduit: Arc<dyn RequestConduit>) -> Self {
        Self { conduit }
    }
}

#[async_trait]
impl SpecificationResolver for RemoteSpecificationResolver {
    async fn resolve(
        &self,
        specification: &Specification,
    ) -> Result<Specification, CollaboratorError> {
        let request = ResolutionRequest {
            specification: specification.clone(),
        };
        let response: ResolutionResponse = conduit::call(self.conduit.as_ref(), &request).await?;
        response
            .resolved_specification
            .ok_or_else(|| CollaboratorError::Unresolvable(specification.clone()))
    }
}

/// Answers resolution requests with a local resolver.
pub struct ResolutionServer<R> {
    resolver: R,
}

impl<R> ResolutionServer<R> {
    /// Serve answers from `resolver`.
    pub const fn new(resolver: R) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl<R: SpecificationResolver + 'static> RequestHandler for ResolutionServer<R> {
    async fn handle(&self, payload: serde_json::Value) -> Result<serde_json::Value, ConduitError> {
        let request: ResolutionRequest = serde_json::from_value(payload)?;
        let resolved_specification = match self.resolver.resolve(&request.specification).await {
            Ok(resolved) => Some(resolved),
            Err(CollaboratorError::Unresolvable(_)) => None,
            Err(e) => return Err(ConduitError::Remote(e.to_string())),
        };
        Ok(serde_json::to_value(ResolutionResponse {
            resolved_specification,
        })?)
    }
}

/// Resolves through a fixed table. Unknown specifications are unresolvable.
#[derive(Debug, Clone, Default)]
pub struct MappingResolver {
    mappings: HashMap<Specification, Specification>,
}

impl MappingResolver {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `raw` to `resolved`.
    #[must_use]
    pub fn with_mapping(mut self, raw: Specification, resolved: Specification) -> Self {
        self.mappings.insert(raw, resolved);
        self
    }
}

#[async_trait]
impl SpecificationResolver for MappingResolver {
    async fn resolve(
        &self,
        specification: &Specification,
    ) -> Result<Specification, CollaboratorError> {
        self.mappings
            .get(specification)
            .cloned()
            .ok_or_else(|| CollaboratorError::Unresolvable(specification.clone()))
    }
}
