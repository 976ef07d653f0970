//! HTTP surface: `POST /v1/invoke`, `POST /v1/stream`, `GET /metrics` and `GET /health`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use neura_core::errors::InterfaceError;
use neura_core::{ApplicationError, Clock, MetricsSnapshot, RequestEnvelope};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gateway::{ActionTarget, Gateway};
use crate::health;
use crate::sse::{self, StreamSettings};

pub const REPLAY_HEADER: &str = "idempotent-replay";

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub streaming: StreamSettings,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InvokeBody {
    pub request: RequestEnvelope,
    pub target: ActionTarget,
}

pub fn router(state: AppState) -> Router {
    let health = health::router(state.gateway.clone());
    Router::new()
        .route("/v1/invoke", post(invoke))
        .route("/v1/stream", post(stream))
        .route("/metrics", get(metrics))
        .with_state(state)
        .merge(health)
}

pub async fn invoke(
    State(state): State<AppState>,
    body: Result<Json<InvokeBody>, JsonRejection>,
) -> Response {
    let Json(InvokeBody { request, target }) = match body {
        Ok(body) => body,
        Err(rejection) => return malformed(rejection),
    };
    let admission = match state.gateway.admit(request, target) {
        Ok(admission) => admission,
        Err(error) => return error_response(&error),
    };

    match state.gateway.execute(admission).await {
        Ok(reuse) => {
            let mut response = (StatusCode::OK, Json(reuse.value)).into_response();
            if reuse.reused {
                response.headers_mut().insert(REPLAY_HEADER, HeaderValue::from_static("true"));
            }
            response
        }
        Err(failure) => (status_of(&failure.error), Json(failure.envelope)).into_response(),
    }
}

/// Admission runs before the stream opens, so guard rejections keep their
/// HTTP status. Everything after that travels as SSE events.
pub async fn stream(
    State(state): State<AppState>,
    body: Result<Json<InvokeBody>, JsonRejection>,
) -> Response {
    let Json(InvokeBody { request, target }) = match body {
        Ok(body) => body,
        Err(rejection) => return malformed(rejection),
    };
    let admission = match state.gateway.admit(request, target) {
        Ok(admission) => admission,
        Err(error) => return error_response(&error),
    };

    let (channel, frames) = sse::channel(state.streaming, state.clock.clone());
    let gateway = state.gateway.clone();
    let correlation_id = admission.correlation_id.clone();
    tokio::spawn(async move {
        if let Err(error) = gateway.stream(admission, channel).await {
            debug!(
                event_name = "stream.relay.stopped",
                correlation_id = %correlation_id,
                error = %error,
                "stream relay stopped"
            );
        }
    });

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Body::from_stream(frames.into_body_stream()),
    )
        .into_response()
}

pub async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.gateway.metrics().snapshot())
}

fn malformed(rejection: JsonRejection) -> Response {
    let correlation_id = uuid::Uuid::new_v4().to_string();
    warn!(
        event_name = "http.request.malformed",
        correlation_id = %correlation_id,
        error = %rejection.body_text(),
        "request body rejected"
    );
    let error = ApplicationError::Validation(neura_core::domain::request::ValidationError {
        issues: vec![rejection.body_text()],
    })
    .into_interface(correlation_id);
    error_response(&error)
}

fn error_response(error: &InterfaceError) -> Response {
    (status_of(error), Json(error.payload())).into_response()
}

fn status_of(error: &InterfaceError) -> StatusCode {
    StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
