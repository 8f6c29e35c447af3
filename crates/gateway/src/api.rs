//! HTTP surface: chat enqueue, persona preference, hot-buffer history, and
//! health.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use auth::{AuthError, Identity};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use metrics::counter;
use serde::{Deserialize, Serialize};
use session_cache::HotBufferEntry;
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::error::GatewayError;
use crate::protocol::{ChatRequest, InboundChatFrame};
use crate::sink::NullSink;
use crate::ws_server::AppState;

/// User-preference slot holding the persona selection.
const PERSONA_KEY: &str = "persona";

/// Create the HTTP API router. Every request carries a hard deadline.
pub fn api_router(state: Arc<AppState>, request_deadline: Duration) -> Router {
    Router::new()
        .route("/chat", post(enqueue_chat_handler))
        .route("/v1/persona", get(get_persona_handler).patch(set_persona_handler))
        .route("/v1/history/{room_id}", get(history_handler))
        .route("/healthz", get(health_handler))
        .layer(axum::middleware::from_fn(move |req: Request, next: Next| {
            deadline(request_deadline, req, next)
        }))
        .with_state(state)
}

async fn deadline(limit: Duration, req: Request, next: Next) -> Response {
    match timeout(limit, next.run(req)).await {
        Ok(response) => response,
        Err(_) => api_error(StatusCode::GATEWAY_TIMEOUT, "deadline exceeded").into_response(),
    }
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Serialize)]
struct QueuedResponse {
    status: String,
    id: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    connections: usize,
    active_tickets: usize,
}

#[derive(Deserialize)]
struct PersonaPatch {
    #[serde(default)]
    persona: Option<String>,
}

#[derive(Serialize)]
struct PersonaResponse {
    persona: Option<String>,
}

#[derive(Serialize)]
struct PersonaSetResponse {
    status: String,
    persona: String,
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HistoryResponse {
    conversation_id: String,
    messages: Vec<HotBufferEntry>,
    count: usize,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, reason: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: reason.into(),
        }),
    )
}

fn dispatch_error(e: GatewayError) -> ApiError {
    let status = match &e {
        GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        GatewayError::Conflict => StatusCode::CONFLICT,
        GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
        GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e.client_code())
}

async fn bearer_identity(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let verified = match headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        Some(header) => match auth::bearer_token(header) {
            Ok(token) => state.authenticate(token).await,
            Err(e) => Err(e),
        },
        None => Err(AuthError::MissingToken),
    };

    verified.map_err(|e| {
        debug!("request rejected: {}", e);
        api_error(StatusCode::UNAUTHORIZED, "unauthenticated")
    })
}

// =============================================================================
// Handlers
// =============================================================================

/// Enqueue a chat without a WebSocket. The relay is fire-and-forget: chunks
/// still land in the hot buffer and the raw-memory stream, but nothing
/// streams back on this surface.
async fn enqueue_chat_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(frame): Json<InboundChatFrame>,
) -> Result<Json<QueuedResponse>, ApiError> {
    let identity = bearer_identity(&state, &headers).await?;
    let request = ChatRequest::from(frame);

    let active = state
        .dispatcher
        .begin(&identity, request, None)
        .await
        .map_err(dispatch_error)?;
    let id = active.ticket_id().to_string();
    counter!("gateway_enqueued_total").increment(1);

    let dispatcher = state.dispatcher.clone();
    let ticket = id.clone();
    tokio::spawn(async move {
        let outcome = dispatcher.relay(active, &NullSink).await;
        info!(ticket = %ticket, outcome = ?outcome, "queued dispatch finished");
    });

    Ok(Json(QueuedResponse {
        status: "queued".to_string(),
        id,
    }))
}

/// The authenticated user's persona preference, empty when unset.
async fn get_persona_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<PersonaResponse>, ApiError> {
    let identity = bearer_identity(&state, &headers).await?;
    match state.cache.get_user_key(&identity.subject, PERSONA_KEY).await {
        Ok(persona) => Ok(Json(PersonaResponse { persona })),
        Err(e) => {
            error!("persona read failed for {}: {}", identity.subject, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// Store the user's persona preference.
async fn set_persona_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(patch): Json<PersonaPatch>,
) -> Result<Json<PersonaSetResponse>, ApiError> {
    let identity = bearer_identity(&state, &headers).await?;
    let Some(persona) = patch.persona.filter(|p| !p.trim().is_empty()) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "missing 'persona' field"));
    };

    if let Err(e) = state
        .cache
        .set_user_key(&identity.subject, PERSONA_KEY, &persona)
        .await
    {
        error!("persona write failed for {}: {}", identity.subject, e);
        return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
    }

    Ok(Json(PersonaSetResponse {
        status: "success".to_string(),
        persona,
    }))
}

/// Recent hot-buffer entries for a conversation, oldest first.
async fn history_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let _identity = bearer_identity(&state, &headers).await?;
    let limit = query.limit.unwrap_or(50).min(state.history_limit);

    match state.cache.recent_messages(&room_id, limit).await {
        Ok(messages) => {
            let count = messages.len();
            Ok(Json(HistoryResponse {
                conversation_id: room_id,
                messages,
                count,
            }))
        }
        Err(e) => {
            error!("history read failed for {}: {}", room_id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// Health check endpoint.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        connections: state.connections.load(Ordering::Relaxed),
        active_tickets: state.dispatcher.registry().active_count(),
    })
}
