//! WebSocket edge: per-connection glue between a browser and the
//! dispatcher.
//!
//! Tokens arrive as a query parameter because browsers cannot set headers
//! on a WebSocket upgrade. A rejected token still completes the upgrade so
//! the client sees close code 1008 instead of a bare HTTP error.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use auth::{AuthError, Identity, TokenVerifier};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::Deserialize;
use session_cache::SessionStore;
use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::protocol::{ChatRequest, ErrorFrame, InboundChatFrame, ACK_FRAME};
use crate::sink::WsSink;
use crate::ticket::ConnectionId;

/// Shared application state.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub verifier: TokenVerifier,
    pub cache: Arc<dyn SessionStore>,
    pub connections: AtomicUsize,
    pub keepalive: Duration,
    /// Cap applied to history reads; mirrors the hot-buffer limit.
    pub history_limit: usize,
    /// Flips to true when the server is going away.
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    /// Verify a token and apply the revocation check.
    pub async fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let verified = self.verifier.verify(token)?;
        if let Some(jti) = &verified.jwt_id {
            match self.cache.is_token_revoked(jti).await {
                Ok(true) => return Err(AuthError::Revoked),
                Ok(false) => {}
                // A degraded cache must not take auth down with it.
                Err(e) => warn!("revocation check failed: {}", e),
            }
        }
        Ok(verified.identity)
    }
}

/// Create the WebSocket router at the configured stream path.
pub fn ws_router(state: Arc<AppState>, stream_path: &str) -> Router {
    Router::new()
        .route(stream_path, get(ws_handler))
        .with_state(state)
}

#[derive(Deserialize)]
struct StreamQuery {
    #[serde(default)]
    token: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.token))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, token: Option<String>) {
    let verified = match token {
        Some(token) => state.authenticate(&token).await,
        None => Err(AuthError::MissingToken),
    };
    let identity = match verified {
        Ok(identity) => identity,
        Err(e) => {
            debug!("rejecting socket: {}", e);
            close_unauthenticated(socket).await;
            return;
        }
    };

    let connection: ConnectionId = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Single writer task: chunks, errors, and keepalives all go through one
    // channel so socket writes stay serialized.
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    state.connections.fetch_add(1, Ordering::Relaxed);
    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.connections.load(Ordering::Relaxed) as f64);
    info!(%connection, subject = %identity.subject, "client connected");

    let mut keepalive = interval(state.keepalive);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    keepalive.reset();
    let mut shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                info!(%connection, "server going away");
                let _ = tx.send(Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "going away".into(),
                })));
                break;
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text_frame(&state, &identity, connection, &tx, text.as_str());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = tx.send(Message::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(%connection, "websocket error: {}", e);
                        break;
                    }
                }
            }

            _ = keepalive.tick() => {
                if tx.send(Message::Text("".into())).is_err() {
                    break;
                }
            }
        }
    }

    // Closing the socket cancels its tickets; each finishes its drain phase
    // on its own task.
    state.dispatcher.cancel_connection(connection);

    state.connections.fetch_sub(1, Ordering::Relaxed);
    gauge!("gateway_active_connections").set(state.connections.load(Ordering::Relaxed) as f64);
    counter!("gateway_disconnections_total").increment(1);

    drop(tx);
    let _ = tokio::time::timeout(Duration::from_secs(5), send_task).await;
    info!(%connection, "client disconnected");
}

/// Handle one inbound text frame. Valid requests dispatch concurrently with
/// further reads; the registry's conflict rule keeps overlapping dispatches
/// per conversation out.
fn handle_text_frame(
    state: &Arc<AppState>,
    identity: &Identity,
    connection: ConnectionId,
    tx: &mpsc::UnboundedSender<Message>,
    text: &str,
) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        // Client keepalive.
        return;
    }
    if trimmed == ACK_FRAME {
        // Reserved control frame.
        return;
    }

    let frame: InboundChatFrame = match serde_json::from_str(trimmed) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(%connection, "unparseable frame: {}", e);
            send_error(tx, "invalid JSON");
            return;
        }
    };

    let request = ChatRequest::from(frame);
    let dispatcher = state.dispatcher.clone();
    let identity = identity.clone();
    let sink = WsSink::new(tx.clone());
    let error_tx = tx.clone();

    tokio::spawn(async move {
        match dispatcher
            .dispatch(&identity, request, Some(connection), &sink)
            .await
        {
            Ok(outcome) => debug!(%connection, outcome = ?outcome, "dispatch finished"),
            Err(e) => {
                counter!("gateway_dispatch_errors_total").increment(1);
                send_error(&error_tx, &e.client_code());
            }
        }
    });
}

fn send_error(tx: &mpsc::UnboundedSender<Message>, reason: &str) {
    match serde_json::to_string(&ErrorFrame {
        error: reason.to_string(),
    }) {
        Ok(json) => {
            let _ = tx.send(Message::Text(json.into()));
        }
        Err(e) => warn!("error frame serialization failed: {}", e),
    }
}

async fn close_unauthenticated(mut socket: WebSocket) {
    counter!("gateway_auth_failures_total").increment(1);
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: "unauthenticated".into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
