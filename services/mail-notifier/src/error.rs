//! Service-specific error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use inbox_monitor::{AuthorsError, MonitorError};
use mail_api::{ApiError, ProviderError};
use oauth_session::{AuthError, StoreError};

/// Errors returned by control API handlers.
///
/// Rendered as `{"error": "..."}` with a status matching the failure.
/// Authorization failures carry the actionable "please re-authorize" text.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Authors(#[from] AuthorsError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("invalid request: {0}")]
    BadRequest(String),
}

impl ControlError {
    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::Api(ApiError::Unauthenticated(e)) | ControlError::Auth(e) => auth_status(e),
            ControlError::Api(ApiError::Unauthorized) => StatusCode::UNAUTHORIZED,
            ControlError::Api(ApiError::Provider(ProviderError::RateLimited(_))) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ControlError::Api(ApiError::Provider(_)) => StatusCode::BAD_GATEWAY,
            ControlError::Authors(AuthorsError::Invalid(_)) => StatusCode::BAD_REQUEST,
            ControlError::Authors(AuthorsError::Duplicate(_)) => StatusCode::CONFLICT,
            ControlError::Authors(AuthorsError::NotFound(_)) => StatusCode::NOT_FOUND,
            ControlError::Authors(AuthorsError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ControlError::Monitor(MonitorError::Store(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Text shown to whoever called the control API.
    pub fn message(&self) -> String {
        match self {
            ControlError::Api(e) => e.user_message(),
            ControlError::Auth(e) => e.user_message(),
            ControlError::Monitor(MonitorError::Store(e)) => e.user_message(),
            other => other.to_string(),
        }
    }
}

fn auth_status(e: &AuthError) -> StatusCode {
    match e {
        AuthError::Store(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        AuthError::PortInUse(_) => StatusCode::CONFLICT,
        AuthError::RefreshFailed(_) => StatusCode::BAD_GATEWAY,
        e if e.requires_reauthorization() => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            serde_json::json!({ "error": self.message() }).to_string(),
        )
            .into_response()
    }
}
