//! Control API for the local user
//!
//! Listens on `[control] listen_addr` (default 127.0.0.1:9090). Replaces a
//! tray menu: authorize, start and stop monitoring, edit the notifiable
//! authors and mark messages read.
//!
//! Endpoints:
//! - GET    /health  session state, monitoring flag, known ids
//! - GET    /metrics  Prometheus text format
//! - POST   /session/authorize  make sure a valid session exists
//! - POST   /session/sign-out  stop monitoring, forget the credential
//! - POST   /monitoring/start  "started" or "already-active"
//! - POST   /monitoring/stop  "stopped" or "not-active"
//! - POST   /monitoring/poll  run one poll now
//! - GET    /authors  notifiable authors
//! - POST   /authors  add `{"email": ...}`
//! - DELETE /authors/{email}  remove an author
//! - POST   /messages/{id}/read  mark a message read

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use inbox_monitor::Monitor;
use mail_api::MailApi;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tracing::info;

use crate::error::ControlError;

/// Shared state for control API handlers.
#[derive(Clone)]
pub struct ControlState {
    monitor: Monitor,
    api: Arc<dyn MailApi>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

impl ControlState {
    pub fn new(monitor: Monitor, api: Arc<dyn MailApi>, prometheus: PrometheusHandle) -> Self {
        Self {
            monitor,
            api,
            prometheus,
            started_at: Instant::now(),
        }
    }
}

/// Build the control router with all endpoints.
///
/// Applies a concurrency limit layer based on `max_connections`.
pub fn build_control_router(state: ControlState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/session/authorize", post(authorize))
        .route("/session/sign-out", post(sign_out))
        .route("/monitoring/start", post(start_monitoring))
        .route("/monitoring/stop", post(stop_monitoring))
        .route("/monitoring/poll", post(poll_now))
        .route("/authors", get(list_authors).post(add_author))
        .route("/authors/{email}", delete(remove_author))
        .route("/messages/{id}/read", post(mark_read))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /health
async fn health(State(state): State<ControlState>) -> Response {
    let session = state.monitor.gate().session().state();
    json(
        StatusCode::OK,
        serde_json::json!({
            "status": "ok",
            "session": session.label(),
            "monitoring": state.monitor.is_active(),
            "known_messages": state.monitor.known_count(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        }),
    )
}

/// GET /metrics
async fn metrics_text(State(state): State<ControlState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// POST /session/authorize
///
/// Returns once a valid session exists. With no stored credential this
/// opens the browser and waits for the consent screen.
async fn authorize(State(state): State<ControlState>) -> Result<Response, ControlError> {
    let session = state.monitor.gate().session();
    let bundle = session.ensure_valid_session().await?;
    Ok(json(
        StatusCode::OK,
        serde_json::json!({
            "session": session.state().label(),
            "expires_at": bundle.expiry_epoch_millis,
        }),
    ))
}

/// POST /session/sign-out
async fn sign_out(State(state): State<ControlState>) -> Result<Response, ControlError> {
    state.monitor.stop().await;
    let session = state.monitor.gate().session();
    session.sign_out().await?;
    Ok(json(
        StatusCode::OK,
        serde_json::json!({ "session": session.state().label() }),
    ))
}

/// POST /monitoring/start
async fn start_monitoring(State(state): State<ControlState>) -> Result<Response, ControlError> {
    let outcome = state.monitor.start().await?;
    Ok(json(
        StatusCode::OK,
        serde_json::json!({ "status": outcome.label() }),
    ))
}

/// POST /monitoring/stop
async fn stop_monitoring(State(state): State<ControlState>) -> Response {
    let outcome = state.monitor.stop().await;
    json(
        StatusCode::OK,
        serde_json::json!({ "status": outcome.label() }),
    )
}

/// POST /monitoring/poll
async fn poll_now(State(state): State<ControlState>) -> Response {
    if !state.monitor.is_active() {
        return json(
            StatusCode::CONFLICT,
            serde_json::json!({ "error": "monitoring is not active" }),
        );
    }
    state.monitor.poll_once().await;
    json(
        StatusCode::OK,
        serde_json::json!({ "status": "polled", "known_messages": state.monitor.known_count() }),
    )
}

/// GET /authors
async fn list_authors(State(state): State<ControlState>) -> Response {
    let authors = state.monitor.dispatcher().authors().list().await;
    json(StatusCode::OK, serde_json::json!({ "authors": authors }))
}

#[derive(Deserialize)]
struct AddAuthorRequest {
    email: String,
}

/// POST /authors
async fn add_author(
    State(state): State<ControlState>,
    axum::Json(body): axum::Json<AddAuthorRequest>,
) -> Result<Response, ControlError> {
    let authors = state.monitor.dispatcher().authors().add(&body.email).await?;
    Ok(json(
        StatusCode::CREATED,
        serde_json::json!({ "authors": authors }),
    ))
}

/// DELETE /authors/{email}
async fn remove_author(
    State(state): State<ControlState>,
    Path(email): Path<String>,
) -> Result<Response, ControlError> {
    let authors = state.monitor.dispatcher().authors().remove(&email).await?;
    Ok(json(StatusCode::OK, serde_json::json!({ "authors": authors })))
}

/// POST /messages/{id}/read
async fn mark_read(
    State(state): State<ControlState>,
    Path(id): Path<String>,
) -> Result<Response, ControlError> {
    if id.trim().is_empty() {
        return Err(ControlError::BadRequest("message id is empty".into()));
    }
    let api = state.api.clone();
    let message_id = id.clone();
    state
        .monitor
        .gate()
        .call("mark_read", move |token| {
            let api = api.clone();
            let id = message_id.clone();
            async move { api.mark_read(&token, &id).await }
        })
        .await?;

    info!(message_id = %id, "marked message read");
    Ok(json(
        StatusCode::OK,
        serde_json::json!({ "id": id, "status": "read" }),
    ))
}
