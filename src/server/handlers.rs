use std::convert::Infallible;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, error, warn};

use super::routes::AppState;
use crate::error::{ErrorKind, InferError};
use crate::session::registry::SessionInfo;
use crate::session::{ConversationId, END_TOKEN, GenerationEvent, GenerationRequest};

#[derive(Serialize)]
pub struct StopResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: String,
    pub model: String,
    pub context_window: usize,
    pub active_sessions: usize,
    pub sessions: Vec<SessionInfo>,
    pub started_at: DateTime<Utc>,
}

impl IntoResponse for InferError {
    fn into_response(self) -> Response {
        let (status, error_type) = match self.kind() {
            _ if self.is_client_error() => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            ErrorKind::ModelUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "model_unavailable"),
            ErrorKind::ResourceExhausted => {
                (StatusCode::SERVICE_UNAVAILABLE, "resource_exhausted")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        };

        if status.is_server_error() {
            error!(err = %self, "request failed");
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
            }
        }));

        (status, body).into_response()
    }
}

/// Text chunk written to the response body for one stream event.
fn event_bytes(event: GenerationEvent) -> Bytes {
    match event {
        GenerationEvent::Token(text) => Bytes::from(text),
        GenerationEvent::Failed(e) => {
            warn!(err = %e, "generation failed mid-stream");
            Bytes::from(format!("\n[ERROR] {e}\n"))
        }
        GenerationEvent::Done => Bytes::from_static(END_TOKEN.as_bytes()),
    }
}

// -- Generation ----------------------------------------------------------

pub async fn generate(
    State(state): State<AppState>,
    payload: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Response, InferError> {
    let Json(request) = payload.map_err(|e| InferError::InvalidRequest(e.body_text()))?;
    let stream = state.coordinator.start(request).await?;
    debug!("starting stream");

    let body = stream.map(|event| Ok::<_, Infallible>(event_bytes(event)));

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(body),
    )
        .into_response())
}

pub async fn stop(
    State(state): State<AppState>,
    Path(conversation_id): Path<ConversationId>,
) -> Json<StopResponse> {
    debug!(conversation_id, "stop requested");
    state.coordinator.stop(conversation_id).await;
    Json(StopResponse { status: "stopped" })
}

// -- Status --------------------------------------------------------------

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let gateway = state.coordinator.gateway();
    let sessions = state.coordinator.registry().snapshot();
    Json(HealthResponse {
        status: "ok",
        backend: gateway.name().to_string(),
        model: gateway.model().to_string(),
        context_window: gateway.context_window(),
        active_sessions: sessions.len(),
        sessions,
        started_at: state.started_at,
    })
}
