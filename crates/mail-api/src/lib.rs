//! Mail provider API and the call gate in front of it
//!
//! `MailApi` is the seam to the provider: list unread messages, fetch one
//! message, mark one read. Every call takes the bearer token explicitly so
//! implementations stay stateless. `ApiGate` is how the rest of the system
//! calls it: the gate obtains a valid token from the session manager, runs
//! the operation, and on a provider "unauthorized" revalidates once and
//! retries once.

pub mod gate;
pub mod gmail;
pub mod message;

pub use gate::{ApiError, ApiGate};
pub use gmail::GmailClient;
pub use message::{Attachment, MessageDetails};

use std::future::Future;
use std::pin::Pin;

/// How much of an error response body is kept for diagnostics.
const ERROR_BODY_LIMIT: usize = 512;

/// Errors reported by a provider API call.
///
/// Only `Unauthorized` is acted on by the gate; everything else is handed
/// back to the caller untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The provider rejected the bearer token (HTTP 401)
    #[error("provider rejected the access token")]
    Unauthorized,

    #[error("provider rate limit hit: {0}")]
    RateLimited(String),

    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::Unauthorized => "unauthorized",
            ProviderError::RateLimited(_) => "rate_limited",
            ProviderError::Status { .. } => "status",
            ProviderError::Network(_) => "network",
            ProviderError::Decode(_) => "decode",
        }
    }
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Map a non-success HTTP status and its body to a provider error.
pub fn classify_status(status: u16, body: &str) -> ProviderError {
    let body = truncate(body.trim(), ERROR_BODY_LIMIT);
    match status {
        401 => ProviderError::Unauthorized,
        429 => ProviderError::RateLimited(body),
        _ => ProviderError::Status { status, body },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Token-gated mail provider operations.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn MailApi>`).
pub trait MailApi: Send + Sync {
    /// Ids of unread messages, newest first.
    ///
    /// With `after_epoch_millis` only messages received after that instant
    /// are listed (the provider's granularity is whole seconds).
    fn list_unread<'a>(
        &'a self,
        token: &'a str,
        after_epoch_millis: Option<u64>,
        max_results: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<String>>> + Send + 'a>>;

    fn get_message<'a>(
        &'a self,
        token: &'a str,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<MessageDetails>> + Send + 'a>>;

    fn mark_read<'a>(
        &'a self,
        token: &'a str,
        id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_401_is_unauthorized() {
        assert_eq!(classify_status(401, "{}"), ProviderError::Unauthorized);
        assert_eq!(classify_status(401, "").kind(), "unauthorized");
    }

    #[test]
    fn status_429_is_rate_limited() {
        let err = classify_status(429, "quota exceeded");
        assert_eq!(err, ProviderError::RateLimited("quota exceeded".into()));
        assert_eq!(err.kind(), "rate_limited");
    }

    #[test]
    fn other_statuses_keep_status_and_body() {
        let err = classify_status(503, " backend unavailable \n");
        assert_eq!(
            err,
            ProviderError::Status {
                status: 503,
                body: "backend unavailable".into()
            }
        );
        assert_eq!(err.kind(), "status");
    }

    #[test]
    fn forbidden_is_not_treated_as_unauthorized() {
        // 403 means missing scope, a fresh token won't help
        assert!(!matches!(
            classify_status(403, "insufficient scope"),
            ProviderError::Unauthorized
        ));
    }

    #[test]
    fn long_bodies_are_truncated_on_char_boundary() {
        let body = "é".repeat(600);
        match classify_status(500, &body) {
            ProviderError::Status { body, .. } => {
                assert!(body.ends_with("..."));
                assert!(body.len() <= ERROR_BODY_LIMIT + 3);
            }
            other => panic!("expected Status, got {other:?}"),
        }
    }
}
