//! Token bundle and the token backend client
//!
//! The backend holds the confidential client secret and fronts the provider's
//! token endpoint. Two interactions:
//! 1. Authorization code exchange (`{authorizationCode, codeVerifier, redirectUri}`)
//! 2. Refresh (`{refreshToken}`)
//!
//! Both return the provider's token response. Neither retries: retry policy
//! belongs to the session manager.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AuthError, Result};

/// Error codes in a refresh failure that mean the refresh token is gone for good.
const REVOKED_GRANT_CODES: &[&str] = &["invalid_grant", "unauthorized_client"];

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The session's credential.
///
/// `expiry_epoch_millis` is absolute, computed from the response's
/// `expires_in` at the time the response was received. A bundle without a
/// refresh token can never be renewed silently; expiry means consent again.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expiry_epoch_millis: u64,
    #[serde(default)]
    pub scope: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl TokenBundle {
    /// Build a bundle from a token endpoint response received at `received_at_millis`.
    pub fn from_response(response: TokenResponse, received_at_millis: u64) -> Self {
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
            expiry_epoch_millis: received_at_millis
                .saturating_add(response.expires_in.saturating_mul(1000)),
            scope: response.scope.unwrap_or_default(),
            token_type: response.token_type.unwrap_or_else(default_token_type),
        }
    }

    pub fn has_access_token(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// True when the bundle expires before `now + margin`.
    pub fn expires_within(&self, margin: Duration, now_millis: u64) -> bool {
        self.expiry_epoch_millis < now_millis.saturating_add(margin.as_millis() as u64)
    }

    /// Refresh responses may omit the refresh token; keep the one we had.
    pub fn keeping_refresh_token_of(mut self, previous: &TokenBundle) -> Self {
        if self.refresh_token.is_none() {
            self.refresh_token.clone_from(&previous.refresh_token);
        }
        self
    }

    /// Serialized form kept in the credential store.
    pub fn to_blob(&self) -> String {
        // A struct of strings and integers always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_blob(blob: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(blob)
    }
}

impl fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBundle")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expiry_epoch_millis", &self.expiry_epoch_millis)
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .finish()
    }
}

/// Success body from the token backend for both exchange and refresh.
///
/// `expires_in` is a delta in seconds. Refresh responses usually omit
/// `refresh_token`.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// Failure body from the token backend: `{error, details?}`.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    details: Option<ErrorDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetails {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl ErrorBody {
    fn parse(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }

    fn is_revoked_grant(&self) -> bool {
        let detail_code = self.details.as_ref().and_then(|d| d.error.as_deref());
        [detail_code, self.error.as_deref()]
            .into_iter()
            .flatten()
            .any(|code| REVOKED_GRANT_CODES.contains(&code))
    }

    fn summary(&self, status: reqwest::StatusCode, raw: &str) -> String {
        let code = self
            .details
            .as_ref()
            .and_then(|d| d.error.as_deref())
            .or(self.error.as_deref());
        let description = self
            .details
            .as_ref()
            .and_then(|d| d.error_description.as_deref());
        match (code, description) {
            (Some(code), Some(desc)) => format!("{status}: {code} ({desc})"),
            (Some(code), None) => format!("{status}: {code}"),
            _ => format!("{status}: {raw}"),
        }
    }
}

/// Trades an authorization code or a refresh token for a token bundle.
///
/// Uses `Pin<Box<dyn Future>>` return types so the session manager can hold
/// an `Arc<dyn TokenExchange>`.
pub trait TokenExchange: Send + Sync {
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        verifier: &'a str,
        redirect_uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenBundle>> + Send + 'a>>;

    /// On a revoked or expired refresh token returns `InvalidGrant`; anything
    /// else is transient.
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenBundle>> + Send + 'a>>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRequest<'a> {
    authorization_code: &'a str,
    code_verifier: &'a str,
    redirect_uri: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// HTTP client for the token backend.
#[derive(Clone)]
pub struct BackendTokenClient {
    http: reqwest::Client,
    exchange_url: String,
    refresh_url: String,
}

impl BackendTokenClient {
    pub fn new(
        http: reqwest::Client,
        exchange_url: impl Into<String>,
        refresh_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            exchange_url: exchange_url.into(),
            refresh_url: refresh_url.into(),
        }
    }

    async fn exchange(&self, code: &str, verifier: &str, redirect_uri: &str) -> Result<TokenBundle> {
        let response = self
            .http
            .post(&self.exchange_url)
            .json(&ExchangeRequest {
                authorization_code: code,
                code_verifier: verifier,
                redirect_uri,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuthError::Timeout("code exchange".into())
                } else {
                    AuthError::Exchange(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let raw = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            let body = ErrorBody::parse(&raw);
            return Err(AuthError::Exchange(body.summary(status, &raw)));
        }

        let parsed = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::Exchange(format!("invalid token response: {e}")))?;
        debug!("authorization code exchanged");
        Ok(TokenBundle::from_response(parsed, now_millis()))
    }

    async fn renew(&self, refresh_token: &str) -> Result<TokenBundle> {
        let response = self
            .http
            .post(&self.refresh_url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuthError::Timeout("token refresh".into())
                } else {
                    AuthError::RefreshFailed(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let raw = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));
            let body = ErrorBody::parse(&raw);
            if body.is_revoked_grant() {
                return Err(AuthError::InvalidGrant(body.summary(status, &raw)));
            }
            return Err(AuthError::RefreshFailed(body.summary(status, &raw)));
        }

        let parsed = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AuthError::RefreshFailed(format!("invalid refresh response: {e}")))?;
        debug!("access token refreshed");
        Ok(TokenBundle::from_response(parsed, now_millis()))
    }
}

impl TokenExchange for BackendTokenClient {
    fn exchange_code<'a>(
        &'a self,
        code: &'a str,
        verifier: &'a str,
        redirect_uri: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenBundle>> + Send + 'a>> {
        Box::pin(self.exchange(code, verifier, redirect_uri))
    }

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<TokenBundle>> + Send + 'a>> {
        Box::pin(self.renew(refresh_token))
    }
}
