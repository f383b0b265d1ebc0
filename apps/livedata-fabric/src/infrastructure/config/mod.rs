//! Configuration Module
//!
//! Configuration loading for the live data fabric service.

mod settings;

pub use settings::{
    BroadcastSettings, ConfigError, FabricConfig, HeartbeatSettings, ServerSettings,
};
