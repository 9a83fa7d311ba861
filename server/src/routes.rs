use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Request, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use lieability_protocol::{
    CreateLobbyRequest, CreateLobbyResponse, JoinLobbyRequest, JoinLobbyResponse, LobbySnapshot,
    VersionInfo,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::coordinator::Coordinator;
use crate::error::LobbyError;
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Coordinator,
    pub version: Arc<str>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/lobbies", post(create_lobby))
        .route("/api/v1/lobbies/:code", get(get_lobby).delete(close_lobby))
        .route("/api/v1/lobbies/:code/join", post(join_lobby))
        .route("/api/v1/lobbies/:code/start", post(start_lobby))
        .route("/api/v1/lobbies/:code/leave", post(leave_lobby))
        .route("/ws/lobbies/:code", get(ws::ws_handler))
        .route("/healthz", get(healthz))
        .route("/version", get(version))
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
}

// Only the path: socket URLs carry the bearer token in their query string.
fn request_span(req: &Request) -> tracing::Span {
    tracing::debug_span!("request", method = %req.method(), path = %req.uri().path())
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
}

// An empty body means "all defaults", so this one skips the Json extractor
// and its content-type check.
async fn create_lobby(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<CreateLobbyResponse>), LobbyError> {
    let req = if body.iter().all(u8::is_ascii_whitespace) {
        CreateLobbyRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| LobbyError::MalformedBody(e.to_string()))?
    };
    let created = state.coordinator.create_lobby(req)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn join_lobby(
    State(state): State<AppState>,
    Path(code): Path<String>,
    body: Result<Json<JoinLobbyRequest>, JsonRejection>,
) -> Result<Json<JoinLobbyResponse>, LobbyError> {
    let Json(req) = body.map_err(|e| LobbyError::MalformedBody(e.body_text()))?;
    state.coordinator.join(&code, req).map(Json)
}

async fn get_lobby(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<LobbySnapshot>, LobbyError> {
    state
        .coordinator
        .snapshot(&code, authorization(&headers))
        .map(Json)
}

async fn start_lobby(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, LobbyError> {
    state.coordinator.start(&code, authorization(&headers))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn leave_lobby(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, LobbyError> {
    state.coordinator.leave(&code, authorization(&headers))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn close_lobby(
    State(state): State<AppState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, LobbyError> {
    state.coordinator.close(&code, authorization(&headers))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn healthz() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn version(State(state): State<AppState>) -> impl IntoResponse {
    Json(VersionInfo {
        version: state.version.to_string(),
    })
}
