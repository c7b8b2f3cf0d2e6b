//! Error types for Tether
//!
//! All modules use `TetherResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Tether operations
pub type TetherResult<T> = Result<T, TetherError>;

/// All errors that can occur in Tether
#[derive(Error, Debug)]
pub enum TetherError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration file already exists: {0}")]
    ConfigExists(PathBuf),

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Session errors
    #[error("Invalid session ID: {0:?}")]
    InvalidSessionId(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    // Store errors
    #[error("Session store error: {0}")]
    Store(String),

    #[error("Corrupt session row {id}: {reason}")]
    StoreRow { id: String, reason: String },

    // Transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport did not connect within {secs}s")]
    TransportTimeout { secs: u64 },

    // Server errors
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl TetherError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a transport error from any displayable cause
    pub fn transport(cause: impl std::fmt::Display) -> Self {
        Self::Transport(cause.to_string())
    }

    /// Check if the retry path may absorb this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::TransportTimeout { .. })
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ConfigInvalid { .. } => Some("Run: tether config show"),
            Self::ConfigExists(_) => Some("Use --force to overwrite"),
            Self::InvalidSessionId(_) => {
                Some("Session IDs are 1-128 characters of [a-zA-Z0-9_@.: -]")
            }
            Self::Bind { .. } => Some("Pick another address with --bind or [gateway] bind"),
            Self::Store(_) => Some("Check the [store] path and its permissions"),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for TetherError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}
