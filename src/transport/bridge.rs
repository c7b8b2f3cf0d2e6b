//! WebSocket bridge transport
//!
//! Talks to a messaging bridge that owns the actual network protocol. Each
//! session gets its own socket at `{bridge_url}/sessions/{id}`; the bridge
//! streams JSON frames that map one-to-one onto [`TransportEvent`]s.

use super::{
    Disconnect, DisconnectReason, Link, PairingMode, Transport, TransportEvent, TransportSession,
};
use crate::error::{TetherError, TetherResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// Buffered events per connection before the reader applies backpressure
const EVENT_BUFFER: usize = 64;

/// Transport that connects through a WebSocket messaging bridge
pub struct BridgeTransport {
    base_url: String,
}

impl BridgeTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn session_url(&self, session_id: &str) -> String {
        format!(
            "{}/sessions/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(session_id)
        )
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn open(
        &self,
        session_id: &str,
        pairing: &PairingMode,
    ) -> TetherResult<TransportSession> {
        let url = self.session_url(session_id);
        debug!(session_id, %url, "Opening bridge connection");

        let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(TetherError::transport)?;
        let (mut sink, mut stream) = socket.split();

        let hello = serde_json::to_string(&PairRequest::from(pairing))?;
        sink.send(Message::text(hello))
            .await
            .map_err(TetherError::transport)?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    frame = stream.next() => {
                        let event = match frame {
                            Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                                Ok(event) => event,
                                Err(e) => {
                                    warn!(session_id = %session_id, error = %e, "Ignoring malformed bridge frame");
                                    continue;
                                }
                            },
                            Some(Ok(Message::Close(_))) | None => TransportEvent::Closed(
                                Disconnect::connection_lost("Bridge closed the connection"),
                            ),
                            Some(Err(e)) => TransportEvent::Closed(Disconnect::connection_lost(
                                format!("Bridge connection error: {e}"),
                            )),
                            Some(Ok(_)) => continue,
                        };

                        let closing = matches!(event, TransportEvent::Closed(_));
                        if tx.send(event).await.is_err() || closing {
                            break;
                        }
                    }
                }
            }
        });

        Ok(TransportSession {
            link: Box::new(BridgeLink {
                close_tx: Mutex::new(Some(close_tx)),
            }),
            events: rx,
        })
    }

    fn name(&self) -> &'static str {
        "bridge"
    }
}

struct BridgeLink {
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl Link for BridgeLink {
    async fn close(&self) {
        if let Some(tx) = self.close_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

/// First frame sent on a new bridge socket
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PairRequest<'a> {
    action: &'static str,
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone_number: Option<&'a str>,
}

impl<'a> From<&'a PairingMode> for PairRequest<'a> {
    fn from(mode: &'a PairingMode) -> Self {
        match mode {
            PairingMode::Qr => Self {
                action: "pair",
                mode: "qr",
                phone_number: None,
            },
            PairingMode::Code { phone_number } => Self {
                action: "pair",
                mode: "code",
                phone_number: Some(phone_number),
            },
        }
    }
}

/// Frames received from the bridge
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum BridgeFrame {
    Qr {
        data: String,
    },
    PairingCode {
        data: String,
    },
    Open {
        #[serde(default)]
        name: Option<String>,
    },
    Close {
        reason: DisconnectReason,
        #[serde(default)]
        detail: Option<String>,
    },
    Message {
        data: serde_json::Value,
    },
}

impl From<BridgeFrame> for TransportEvent {
    fn from(frame: BridgeFrame) -> Self {
        match frame {
            BridgeFrame::Qr { data } => Self::Qr(data),
            BridgeFrame::PairingCode { data } => Self::PairingCode(data),
            BridgeFrame::Open { name } => Self::Open { display_name: name },
            BridgeFrame::Close { reason, detail } => Self::Closed(Disconnect::new(
                reason,
                detail.unwrap_or_else(|| "Connection closed".to_string()),
            )),
            BridgeFrame::Message { data } => Self::Message(data),
        }
    }
}

fn parse_frame(text: &str) -> Result<TransportEvent, serde_json::Error> {
    serde_json::from_str::<BridgeFrame>(text).map(TransportEvent::from)
}
