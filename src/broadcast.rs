//! Real-time event fan-out
//!
//! Every status change and inbound message is published once on a tokio
//! broadcast channel. Subscribers that join late only see what is published
//! after they subscribe; they fetch a store snapshot for everything else.

use crate::session::SessionPatch;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Event delivered to real-time subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Partial session updates; always an array on the wire
    #[serde(rename = "session-update")]
    SessionUpdate(Vec<SessionPatch>),

    /// A session and all its state are gone
    #[serde(rename = "session-deleted")]
    SessionDeleted {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// Inbound message, payload passed through untouched
    #[serde(rename = "message")]
    Message {
        #[serde(rename = "sessionId")]
        session_id: String,
        message: serde_json::Value,
    },
}

impl GatewayEvent {
    /// Session this event concerns, if it concerns exactly one
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionUpdate(patches) if patches.len() == 1 => {
                Some(patches[0].session_id.as_str())
            }
            Self::SessionUpdate(_) => None,
            Self::SessionDeleted { session_id } | Self::Message { session_id, .. } => {
                Some(session_id)
            }
        }
    }

    /// Wire tag, also used as the log event name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionUpdate(_) => "session-update",
            Self::SessionDeleted { .. } => "session-deleted",
            Self::Message { .. } => "message",
        }
    }

    /// Serialize to the JSON text sent over the wire
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Fans events out to every current subscriber
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; returns how many subscribers it reached
    pub fn publish(&self, event: GatewayEvent) -> usize {
        let kind = event.kind();
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(event = kind, subscribers = delivered, "Published gateway event");
        delivered
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
