//! API call gate: the only path from callers to the provider
//!
//! 1. Get a session that stays valid for the call margin, renewing a token
//!    that would expire inside it; an auth failure is `Unauthenticated` and
//!    the operation never runs
//! 2. The wider session margin is for session-start checks, not per call
//! 3. Run the operation; on a provider 401, force one revalidation and
//!    retry once. A second 401 is `Unauthorized`
//! 4. Any other provider failure is returned as-is, never retried here

use std::future::Future;
use std::time::Duration;

use oauth_session::{AuthError, SessionManager};
use tracing::{debug, warn};

use crate::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("no valid session: {0}")]
    Unauthenticated(#[source] AuthError),

    #[error("provider rejected the credential after revalidation")]
    Unauthorized,

    #[error(transparent)]
    Provider(ProviderError),
}

impl ApiError {
    /// Whether this failure came from persistence, not from the provider or the user.
    pub fn is_store_failure(&self) -> bool {
        matches!(self, ApiError::Unauthenticated(AuthError::Store(_)))
    }

    /// Message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Unauthenticated(e) => e.user_message(),
            ApiError::Unauthorized => {
                "Mail access was rejected by the provider. Please re-authorize.".to_string()
            }
            ApiError::Provider(e) => format!("Mail provider error: {e}"),
        }
    }
}

/// Wraps provider operations with session checks and the single auth retry.
#[derive(Clone)]
pub struct ApiGate {
    session: SessionManager,
    call_margin: Duration,
}

impl ApiGate {
    pub fn new(session: SessionManager, call_margin: Duration) -> Self {
        Self {
            session,
            call_margin,
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Run `op` with a valid access token.
    ///
    /// `op` may be called twice: once, and once more after a forced
    /// revalidation if the provider answered 401. `name` labels logs and
    /// metrics.
    pub async fn call<T, F, Fut>(&self, name: &'static str, op: F) -> Result<T, ApiError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let outcome = self.run(name, op).await;
        let label = match &outcome {
            Ok(_) => "success",
            Err(ApiError::Unauthenticated(_)) => "unauthenticated",
            Err(ApiError::Unauthorized) => "unauthorized",
            Err(ApiError::Provider(e)) => e.kind(),
        };
        metrics::counter!("gate_calls_total", "operation" => name, "outcome" => label)
            .increment(1);
        outcome
    }

    async fn run<T, F, Fut>(&self, name: &'static str, op: F) -> Result<T, ApiError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let bundle = self
            .session
            .ensure_valid_for(self.call_margin)
            .await
            .map_err(ApiError::Unauthenticated)?;
        debug!(operation = name, expiry = bundle.expiry_epoch_millis, "calling provider");

        match op(bundle.access_token).await {
            Ok(value) => return Ok(value),
            Err(ProviderError::Unauthorized) => {}
            Err(e) => return Err(ApiError::Provider(e)),
        }

        warn!(operation = name, "provider rejected the access token, revalidating once");
        metrics::counter!("gate_auth_retries_total", "operation" => name).increment(1);
        let bundle = self
            .session
            .revalidate()
            .await
            .map_err(ApiError::Unauthenticated)?;

        match op(bundle.access_token).await {
            Ok(value) => Ok(value),
            Err(ProviderError::Unauthorized) => {
                warn!(operation = name, "access token rejected again after revalidation");
                Err(ApiError::Unauthorized)
            }
            Err(e) => Err(ApiError::Provider(e)),
        }
    }
}
