//! Real-time subscriber endpoint
//!
//! `GET /ws` upgrades to a WebSocket that first receives the current
//! session snapshot as one `session-update` batch, then every gateway event
//! as a JSON text frame. `GET /health` reports registry counts.

use crate::broadcast::GatewayEvent;
use crate::error::{TetherError, TetherResult};
use crate::session::SessionManager;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{Sink, SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state passed to handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: SessionManager,
}

/// Build the router with all routes
pub fn build_router(manager: SessionManager) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(AppState { manager })
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, manager: SessionManager, shutdown: F) -> TetherResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, build_router(manager))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| TetherError::io("serving gateway endpoint", e))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.manager))
}

async fn handle_socket(socket: WebSocket, manager: SessionManager) {
    // Subscribe before reading the snapshot so nothing falls in between
    let mut events = manager.subscribe();
    let (mut ws_tx, mut ws_rx) = socket.split();
    info!(subscribers = manager.subscriber_count(), "Subscriber connected");

    match manager.sessions().await {
        Ok(snapshot) => {
            let count = snapshot.len();
            if !send_event(&mut ws_tx, &GatewayEvent::SessionUpdate(snapshot)).await {
                return;
            }
            debug!(sessions = count, "Sent session snapshot");
        }
        Err(e) => warn!(error = %e, "Failed to load session snapshot"),
    }

    let mut ping = tokio::time::interval(HEARTBEAT_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if !send_event(&mut ws_tx, &event).await {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged, dropped events");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = ping.tick() => {
                if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                trace!("Sent ping");
            }
        }
    }

    info!("Subscriber disconnected");
}

/// Returns false once the socket is gone
async fn send_event<S>(ws_tx: &mut S, event: &GatewayEvent) -> bool
where
    S: Sink<WsMessage> + Unpin,
{
    let json = match event.to_json() {
        Ok(json) => json,
        Err(e) => {
            warn!(event = event.kind(), error = %e, "Failed to serialize gateway event");
            return true;
        }
    };
    trace!(
        event = event.kind(),
        session_id = event.session_id().unwrap_or("*"),
        "Sending event"
    );
    ws_tx.send(WsMessage::Text(json.into())).await.is_ok()
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.manager.stats().await;
    Json(serde_json::json!({
        "status": "ok",
        "sessions": stats.sessions,
        "connecting": stats.connecting,
        "live": stats.live,
        "pendingRetries": stats.pending_retries,
        "subscribers": state.manager.subscriber_count(),
    }))
}
