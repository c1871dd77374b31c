//! Validating NDJSON relay between the generation backend and chat clients.
//!
//! The relay never forwards upstream bytes as-is: every complete line is
//! parsed, checked against the event schema and re-serialized.

pub mod framer;
pub mod upstream;

use crate::types::{ChatRequest, RequestValidationError, StreamEvent};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use framer::LineFramer;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{info, warn};
use upstream::{ChatBackend, UpstreamChatRequest, UpstreamError, UpstreamStream};

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";
pub const STREAM_ERROR_MESSAGE: &str = "Error during chat completion";
pub const STREAM_ERROR_CODE: &str = "stream_error";

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] RequestValidationError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        match self {
            RelayError::InvalidRequest(error) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": "Invalid request data",
                    "detail": error.detail(),
                })),
            )
                .into_response(),
            RelayError::Upstream(UpstreamError::Status { status, body }) => {
                let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
                (
                    status,
                    Json(json!({ "error": format!("Backend error: {body}") })),
                )
                    .into_response()
            }
            RelayError::Upstream(error) => (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": format!("Backend error: {error}") })),
            )
                .into_response(),
        }
    }
}

/// Shared state injected into the relay handlers.
#[derive(Clone)]
pub struct RelayState {
    pub backend: Arc<dyn ChatBackend>,
    pub default_retrieval_k: u8,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// POST /api/chat: validate, open the upstream turn, relay its events.
pub async fn chat_handler(
    State(state): State<RelayState>,
    body: Bytes,
) -> Result<Response, RelayError> {
    let request = ChatRequest::from_slice(&body)?;
    let upstream_request = UpstreamChatRequest::from_request(request, state.default_retrieval_k);
    info!(
        session_id = upstream_request.session_id.as_deref().unwrap_or("-"),
        subject = %upstream_request.subject,
        max_retrieval_k = upstream_request.max_retrieval_k,
        "chat request accepted"
    );

    let stream = state
        .backend
        .open_chat(&upstream_request)
        .await
        .inspect_err(|error| warn!(%error, "backend refused chat request"))?;

    let body = Body::from_stream(relay_events(stream).map(Ok::<Bytes, Infallible>));
    Ok((
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

struct RelayLoop {
    upstream: Option<UpstreamStream>,
    framer: LineFramer,
    pending: VecDeque<StreamEvent>,
}

/// Turns an upstream byte stream into validated, newline-terminated events.
///
/// A read error mid-stream drops the partial line and ends the output with a
/// `stream_error` event followed by `done`.
pub fn relay_events(upstream: UpstreamStream) -> impl Stream<Item = Bytes> + Send {
    let state = RelayLoop {
        upstream: Some(upstream),
        framer: LineFramer::new(),
        pending: VecDeque::new(),
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                match event.to_line() {
                    Ok(line) => return Some((line, state)),
                    Err(error) => {
                        warn!(%error, kind = event.kind(), "failed to serialize event");
                        continue;
                    }
                }
            }

            let upstream = state.upstream.as_mut()?;
            match upstream.next().await {
                Some(Ok(chunk)) => {
                    let events = state.framer.push(&chunk);
                    state.pending.extend(events);
                }
                Some(Err(error)) => {
                    let dropped_bytes = state.framer.discard();
                    warn!(%error, dropped_bytes, "upstream stream failed");
                    state
                        .pending
                        .push_back(StreamEvent::error(STREAM_ERROR_MESSAGE, STREAM_ERROR_CODE));
                    state.pending.push_back(StreamEvent::done());
                    state.upstream = None;
                }
                None => {
                    let events = state.framer.finish();
                    state.pending.extend(events);
                    state.upstream = None;
                    let stats = state.framer.stats();
                    info!(
                        forwarded = stats.forwarded,
                        synthesized = stats.synthesized,
                        skipped = stats.skipped,
                        "upstream stream finished"
                    );
                }
            }
        }
    })
}

/// Builds the relay router around an injected backend.
pub fn build_router(backend: Arc<dyn ChatBackend>, default_retrieval_k: u8) -> Router {
    let state = RelayState {
        backend,
        default_retrieval_k,
    };

    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/health", get(health))
        .with_state(state)
}
