//! # HTTP Handlers
//!
//! Thin transport over the orchestrator. Handlers pull tenant identity
//! out of headers, hand the domain request to the gateway, and shape the
//! result: JSON for unary calls, Server-Sent Events for streams, the
//! Prometheus text format for `/metrics`. Error bodies are always the
//! public projection of a `QLensError` with the status code the error
//! kind dictates.

use crate::server::AppState;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::StreamExt;
use qlens_core::error::QLensError;
use qlens_core::models::{
    CompletionRequest, EmbeddingRequest, ProviderId, StreamDelta, StreamFrame,
};
use qlens_core::observability::CorrelationIds;
use serde::Deserialize;
use serde_json::json;

const TENANT_HEADER: &str = "x-tenant-id";
const USER_HEADER: &str = "x-user-id";
const API_KEY_HEADER: &str = "x-api-key";
const CORRELATION_HEADER: &str = "x-correlation-id";

/// Axum-facing wrapper: a `QLensError` becomes `{status, {"error": …}}`.
pub struct ApiError(pub QLensError);

impl From<QLensError> for ApiError {
    fn from(error: QLensError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.0.public_error() }))).into_response()
    }
}

struct Identity {
    tenant_id: String,
    user_id: String,
    correlation_id: String,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Header-level identity checks. Tenant and user are request validation
/// (400 with the failing field); the API key is only checked for
/// presence, which is an authentication failure when absent.
fn request_identity(headers: &HeaderMap, ids: &CorrelationIds) -> Result<Identity, QLensError> {
    let tenant_id = header_value(headers, TENANT_HEADER)
        .ok_or_else(|| QLensError::validation("tenant_id", "X-Tenant-ID header is required"))?;
    let user_id = header_value(headers, USER_HEADER)
        .ok_or_else(|| QLensError::validation("user_id", "X-User-ID header is required"))?;
    header_value(headers, API_KEY_HEADER)
        .ok_or_else(|| QLensError::authentication("X-API-Key header is required"))?;
    let correlation_id =
        header_value(headers, CORRELATION_HEADER).unwrap_or_else(|| ids.next());
    Ok(Identity {
        tenant_id,
        user_id,
        correlation_id,
    })
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn ready(State(state): State<AppState>) -> Response {
    match state.gateway.health_check().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))).into_response(),
        Err(error) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "unavailable", "error": error.public_error() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ModelsQuery {
    pub provider: Option<ProviderId>,
}

pub async fn list_models(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ModelsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    request_identity(&headers, &state.correlation_ids)?;
    let models = state.gateway.list_models(query.provider).await?;
    Ok(Json(json!({ "object": "list", "data": models })))
}

pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    let identity = request_identity(&headers, &state.correlation_ids)?;
    request.tenant_id = identity.tenant_id;
    request.user_id = identity.user_id;
    request.correlation_id = identity.correlation_id;

    if request.stream {
        let frames = state.gateway.create_completion_stream(request).await?;
        return Ok(sse_response(frames));
    }

    let response = state.gateway.create_completion(request).await?;
    Ok(Json(response).into_response())
}

pub async fn embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<EmbeddingRequest>,
) -> Result<Json<qlens_core::models::EmbeddingResponse>, ApiError> {
    let identity = request_identity(&headers, &state.correlation_ids)?;
    request.tenant_id = identity.tenant_id;
    request.user_id = identity.user_id;
    request.correlation_id = identity.correlation_id;

    let response = state.gateway.create_embeddings(request).await?;
    Ok(Json(response))
}

pub async fn metrics_text(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render_prometheus(),
    )
        .into_response()
}

/// Shape a frame stream as Server-Sent Events: one `data:` line per
/// frame, `data: [DONE]` as the terminal line.
fn sse_response(frames: qlens_core::providers::CompletionStream) -> Response {
    let created = Utc::now().timestamp() as u64;
    let body = Body::from_stream(frames.map(move |frame| {
        Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(frame_to_sse(frame, created)))
    }));

    (
        StatusCode::OK,
        [
            ("content-type", "text/event-stream"),
            ("cache-control", "no-cache"),
        ],
        body,
    )
        .into_response()
}

fn frame_to_sse(frame: StreamFrame, created: u64) -> String {
    match frame {
        StreamFrame::Delta(delta) => {
            format!("data: {}\n\n", chunk_json(&delta, created))
        }
        StreamFrame::Done => "data: [DONE]\n\n".to_string(),
        StreamFrame::Error(error) => {
            let payload = json!({ "error": error.public_error() });
            format!("data: {payload}\n\n")
        }
    }
}

fn chunk_json(delta: &StreamDelta, created: u64) -> String {
    json!({
        "id": delta.id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": delta.model,
        "provider": delta.provider,
        "choices": [delta.choice],
    })
    .to_string()
}
