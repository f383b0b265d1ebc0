//! Fabric Configuration Settings
//!
//! Configuration types for the live data fabric, loaded from environment
//! variables. Unparseable values fall back to defaults.

use std::time::Duration;

use crate::domain::market_data::DEFAULT_NORMALIZATION_RULE_SET;

/// Broadcast channel settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Capacity of each provider's event channel.
    pub event_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            event_capacity: 10_000,
        }
    }
}

/// Heartbeat lease settings.
#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    /// How often active specifications are re-announced.
    pub interval: Duration,
    /// How long a specification stays leased without a heartbeat.
    pub lease_timeout: Duration,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            lease_timeout: Duration::from_secs(90),
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Complete fabric configuration.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Constituent provider names, in priority order.
    pub providers: Vec<String>,
    /// Normalization rule set applied to raw specifications.
    pub normalization_rule_set: String,
    /// Server port settings.
    pub server: ServerSettings,
    /// Heartbeat lease settings.
    pub heartbeat: HeartbeatSettings,
    /// Broadcast channel settings.
    pub broadcast: BroadcastSettings,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            providers: vec!["primary".to_string()],
            normalization_rule_set: DEFAULT_NORMALIZATION_RULE_SET.to_string(),
            server: ServerSettings::default(),
            heartbeat: HeartbeatSettings::default(),
            broadcast: BroadcastSettings::default(),
        }
    }
}

impl FabricConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `LIVEDATA_PROVIDERS` names no provider.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `LIVEDATA_PROVIDERS` names no provider.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let providers = match lookup("LIVEDATA_PROVIDERS") {
            Some(raw) => parse_provider_list(&raw)?,
            None => defaults.providers,
        };

        let normalization_rule_set = lookup("LIVEDATA_NORMALIZATION_RULE_SET")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.normalization_rule_set);

        let server = ServerSettings {
            health_port: parse_or(
                lookup("LIVEDATA_HEALTH_PORT"),
                defaults.server.health_port,
            ),
        };

        let heartbeat = HeartbeatSettings {
            interval: parse_duration_secs(
                lookup("LIVEDATA_HEARTBEAT_INTERVAL_SECS"),
                defaults.heartbeat.interval,
            ),
            lease_timeout: parse_duration_secs(
                lookup("LIVEDATA_LEASE_TIMEOUT_SECS"),
                defaults.heartbeat.lease_timeout,
            ),
        };

        let broadcast = BroadcastSettings {
            event_capacity: parse_or(
                lookup("LIVEDATA_EVENT_CAPACITY"),
                defaults.broadcast.event_capacity,
            )
            .max(1),
        };

        Ok(Self {
            providers,
            normalization_rule_set,
            server,
            heartbeat,
            broadcast,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// A provider name appears more than once.
    #[error("provider {0} listed more than once")]
    DuplicateProvider(String),
}

fn parse_provider_list(raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut providers: Vec<String> = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if providers.iter().any(|p| p == name) {
            return Err(ConfigError::DuplicateProvider(name.to_string()));
        }
        providers.push(name.to_string());
    }

    if providers.is_empty() {
        return Err(ConfigError::EmptyValue("LIVEDATA_PROVIDERS".to_string()));
    }
    Ok(providers)
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_secs(value: Option<String>, default: Duration) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map_or(default, Duration::from_secs)
}
