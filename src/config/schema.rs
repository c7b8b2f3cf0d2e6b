//! Configuration schema for Tether
//!
//! Configuration is stored at `~/.config/tether/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Real-time subscriber endpoint
    pub gateway: GatewayConfig,

    /// Session store settings
    pub store: StoreConfig,

    /// Upstream transport settings
    pub transport: TransportConfig,

    /// Reconnection policy
    pub retry: RetryConfig,

    /// Session lifecycle defaults
    pub session: SessionConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable the lifecycle audit journal
    pub audit_log: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
        }
    }
}

/// Real-time endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address the `/ws` and `/health` endpoints listen on
    pub bind: String,

    /// Capacity of the broadcast channel feeding subscribers
    pub event_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            event_buffer: 256,
        }
    }
}

/// Session store configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path (defaults to the state directory)
    pub path: Option<PathBuf>,
}

/// Upstream transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Base URL of the messaging bridge
    pub bridge_url: String,

    /// Give up on a single connect call after this many seconds
    pub connect_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bridge_url: "ws://127.0.0.1:8085".to_string(),
            connect_timeout_secs: 60,
        }
    }
}

/// Reconnection policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Consecutive disconnects tolerated per episode
    pub max_attempts: u32,

    /// Delay before the first reconnect, in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,

    /// Growth factor applied per attempt
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            base_delay_ms: 3_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Reconnect previously paired sessions when the gateway starts
    pub restore_on_start: bool,

    /// Pause between restored sessions, in milliseconds
    pub restore_stagger_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            restore_on_start: true,
            restore_stagger_ms: 3_000,
        }
    }
}
