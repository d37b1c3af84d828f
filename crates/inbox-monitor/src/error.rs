//! Error types for monitoring, dispatch and the authors list

use mail_api::ApiError;

/// Errors from starting or running the ingestion loop.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Credentials could not be read or written while starting a session
    #[error("cannot start monitoring: {0}")]
    Store(#[source] ApiError),
}

/// Errors from the notifiable authors list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorsError {
    #[error("invalid email address: {0:?}")]
    Invalid(String),

    #[error("{0} is already a notifiable author")]
    Duplicate(String),

    #[error("{0} is not a notifiable author")]
    NotFound(String),

    #[error("saving notifiable authors: {0}")]
    Io(String),
}

/// Errors from enrichment or notification delivery.
///
/// Never fatal to a tick: the message is dispatched without the failed
/// enrichment, or the failed notification is logged.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("enrichment failed: {0}")]
    Enrichment(String),

    #[error("notification failed: {0}")]
    Notification(String),
}

/// Result alias for monitor operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
