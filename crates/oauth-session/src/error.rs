//! Error types for the OAuth session lifecycle

/// Errors from the credential store adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("credential store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from authorization, exchange, refresh and session management.
///
/// `Clone` because a single in-flight refresh or authorization hands the
/// same outcome to every caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("redirect port {0} is already in use")]
    PortInUse(u16),

    #[error("authorization denied by provider: {0}")]
    ProviderDenied(String),

    #[error("authorization callback state did not match")]
    StateMismatch,

    #[error("authorization callback carried neither code nor error")]
    MissingCode,

    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("code exchange failed: {0}")]
    Exchange(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("could not open browser: {0}")]
    Browser(String),

    #[error("callback listener failed: {0}")]
    Listener(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Whether recovering from this error takes the user back through the
    /// consent screen.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            AuthError::ProviderDenied(_)
                | AuthError::StateMismatch
                | AuthError::MissingCode
                | AuthError::InvalidGrant(_)
                | AuthError::Exchange(_)
                | AuthError::Timeout(_)
        )
    }

    /// Short message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        if self.requires_reauthorization() {
            format!("Mail access is not authorized ({self}). Please re-authorize.")
        } else {
            format!("Mail session unavailable: {self}")
        }
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, AuthError>;
