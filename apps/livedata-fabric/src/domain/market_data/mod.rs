//! Market Data Identifiers
//!
//! Value types naming upstream data series ([`Specification`]), the
//! consumer-facing keys mapped onto them ([`Requirement`]) and the users
//! that request them ([`UserPrincipal`]).
//!
//! All types are immutable values compared by value. Fields are public so
//! they can arrive over the wire; call `validate()` before trusting one.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Field Names
// =============================================================================

/// Raw field names carried by upstream ticks.
pub mod fields {
    /// Last traded price.
    pub const LAST_PRICE: &str = "LAST_PRICE";
    /// Best bid.
    pub const BID: &str = "BID";
    /// Best ask.
    pub const ASK: &str = "ASK";
}

/// Value name that selects the derived indicative value of an instrument.
pub const MARKET_VALUE: &str = "Market_Value";

/// Normalization rule set applied when a requirement does not name one.
pub const DEFAULT_NORMALIZATION_RULE_SET: &str = "OpenGamma";

/// Field name to last received scalar.
pub type FieldMap = HashMap<String, f64>;

// =============================================================================
// Validation
// =============================================================================

/// A malformed identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A required component was empty or whitespace.
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

fn require_non_empty(value: &str, name: &'static str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty(name));
    }
    Ok(())
}

// =============================================================================
// External Identifier
// =============================================================================

/// Scheme-qualified identifier of an instrument, e.g. `BLOOMBERG_TICKER~AAPL US Equity`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExternalId {
    /// Identifier scheme.
    pub scheme: String,
    /// Identifier value within the scheme.
    pub value: String,
}

impl ExternalId {
    /// Create an identifier.
    #[must_use]
    pub fn of(scheme: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            value: value.into(),
        }
    }

    /// Check that both components are present.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::Empty` naming the missing component.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty(&self.scheme, "external id scheme")?;
        require_non_empty(&self.value, "external id value")
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.scheme, self.value)
    }
}

// =============================================================================
// Specification
// =============================================================================

/// One upstream market data series after resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Specification {
    /// Normalization rule set applied to the raw upstream fields.
    pub normalization_rule_set_id: String,
    /// Upstream identifier of the series.
    pub external_id: ExternalId,
}

impl Specification {
    /// Create a specification.
    #[must_use]
    pub fn new(normalization_rule_set_id: impl Into<String>, external_id: ExternalId) -> Self {
        Self {
            normalization_rule_set_id: normalization_rule_set_id.into(),
            external_id,
        }
    }

    /// Check that the rule set and identifier are present.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::Empty` naming the missing component.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty(&self.normalization_rule_set_id, "normalization rule set id")?;
        self.external_id.validate()
    }
}

impl fmt::Display for Specification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.external_id, self.normalization_rule_set_id)
    }
}

// =============================================================================
// Requirement
// =============================================================================

/// Consumer-facing request for one value of one instrument.
///
/// The value name [`MARKET_VALUE`] selects the indicative value; any other
/// value name selects the raw field of that name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Requirement {
    /// Name of the requested value.
    pub value_name: String,
    /// Instrument the value is requested for.
    pub target: ExternalId,
}

impl Requirement {
    /// Create a requirement.
    #[must_use]
    pub fn new(value_name: impl Into<String>, target: ExternalId) -> Self {
        Self {
            value_name: value_name.into(),
            target,
        }
    }

    /// Requirement for the indicative value of `target`.
    #[must_use]
    pub fn market_value(target: ExternalId) -> Self {
        Self::new(MARKET_VALUE, target)
    }

    /// Check that the value name and target are present.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::Empty` naming the missing component.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty(&self.value_name, "value name")?;
        self.target.validate()
    }

    /// Unresolved specification for this requirement under `rule_set_id`.
    #[must_use]
    pub fn specification(&self, rule_set_id: &str) -> Specification {
        Specification::new(rule_set_id, self.target.clone())
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.value_name, self.target)
    }
}

// =============================================================================
// User
// =============================================================================

/// The user on whose behalf a subscription is made.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserPrincipal {
    /// User name.
    pub user_name: String,
    /// Address the request originated from.
    pub ip_address: String,
}

impl UserPrincipal {
    /// Create a principal.
    #[must_use]
    pub fn new(user_name: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            ip_address: ip_address.into(),
        }
    }

    /// Principal used by in-process callers.
    #[must_use]
    pub fn local(user_name: impl Into<String>) -> Self {
        Self::new(user_name, "127.0.0.1")
    }

    /// Check that the user name is present.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::Empty` if the user name is blank.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty(&self.user_name, "user name")
    }
}

impl fmt::Display for UserPrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_name, self.ip_address)
    }
}

// =============================================================================
// Tests
// =============================================================================
