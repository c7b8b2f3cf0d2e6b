//! Upstream transport abstraction
//!
//! A transport opens one connection to the messaging network for a session
//! and hands back a typed event channel. The connection core consumes that
//! channel in order, so transport callbacks never race each other.

pub mod bridge;
#[cfg(test)]
pub(crate) mod mock;

pub use bridge::BridgeTransport;

use crate::error::TetherResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// How a session authorizes itself with the network
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PairingMode {
    /// Scan a QR code from the phone
    #[default]
    Qr,
    /// Type a numeric code on the phone
    Code { phone_number: String },
}

/// Why a connection closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DisconnectReason {
    ConnectionLost,
    TimedOut,
    PairingFailed,
    LoggedOut,
    Forbidden,
}

impl DisconnectReason {
    /// Permanent reasons (logout, ban) must not be retried
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::LoggedOut | Self::Forbidden)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionLost => "connection-lost",
            Self::TimedOut => "timed-out",
            Self::PairingFailed => "pairing-failed",
            Self::LoggedOut => "logged-out",
            Self::Forbidden => "forbidden",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified connection close
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: DisconnectReason,
    pub detail: String,
}

impl Disconnect {
    pub fn new(reason: DisconnectReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }

    pub fn connection_lost(detail: impl Into<String>) -> Self {
        Self::new(DisconnectReason::ConnectionLost, detail)
    }
}

/// Lifecycle and message events emitted by an open connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A QR payload to display
    Qr(String),
    /// A numeric pairing code to display
    PairingCode(String),
    /// The connection is authenticated
    Open { display_name: Option<String> },
    /// The connection closed
    Closed(Disconnect),
    /// An inbound message, opaque to the gateway
    Message(serde_json::Value),
}

/// Handle used to tear down a live connection
#[async_trait]
pub trait Link: Send + Sync {
    async fn close(&self);
}

/// An opened connection: its teardown handle and its event stream
pub struct TransportSession {
    pub link: Box<dyn Link>,
    pub events: mpsc::Receiver<TransportEvent>,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession").finish_non_exhaustive()
    }
}

/// Opens connections to the messaging network
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection for a session. Network failures are returned as
    /// errors; the caller treats them as a disconnect.
    async fn open(&self, session_id: &str, pairing: &PairingMode)
        -> TetherResult<TransportSession>;

    /// Human-readable transport name for logs
    fn name(&self) -> &'static str;
}
