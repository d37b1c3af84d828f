//! Session manager: the one owner of the token bundle
//!
//! Every caller goes through `ensure_valid_session()`. A fresh bundle is
//! returned from memory without touching the network. Refresh and full
//! authorization are transitions, and only one transition runs at a time:
//! the first caller starts it and everyone arriving while it is pending
//! awaits the same shared result. A transition lives only as long as
//! someone awaits it. When the last caller gives up, it is dropped with its
//! listener and PKCE material, and the next caller starts a fresh one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use reqwest::Url;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::browser::BrowserOpener;
use crate::callback::CallbackReceiver;
use crate::constants::{
    CONSENT_TIMEOUT, DEFAULT_ACCOUNT, DEFAULT_SCOPES, DEFAULT_SERVICE,
    SESSION_REFRESH_MARGIN,
};
use crate::credentials::CredentialStore;
use crate::error::{AuthError, Result};
use crate::pkce::{build_authorization_url, derive_challenge, generate_state, generate_verifier};
use crate::token::{TokenBundle, TokenExchange, now_millis};

/// Settings for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub client_id: String,
    pub authorize_url: Url,
    pub scopes: Vec<String>,
    /// Credential store service key
    pub service: String,
    /// Credential store account key
    pub account: String,
    /// Bundles expiring within this margin are renewed by `ensure_valid_session`
    pub session_margin: Duration,
    pub consent_timeout: Duration,
}

impl SessionConfig {
    /// Config for `client_id` with the Gmail defaults for everything else.
    pub fn new(client_id: impl Into<String>, authorize_url: Url) -> Self {
        Self {
            client_id: client_id.into(),
            authorize_url,
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            service: DEFAULT_SERVICE.to_string(),
            account: DEFAULT_ACCOUNT.to_string(),
            session_margin: SESSION_REFRESH_MARGIN,
            consent_timeout: CONSENT_TIMEOUT,
        }
    }
}

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authorizing,
    Authenticated,
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authorizing => "authorizing",
            SessionState::Authenticated => "authenticated",
        }
    }
}

/// PKCE material for the authorization round trip in progress.
///
/// Lives only between building the URL and the redirect resolving.
struct AuthFlowState {
    code_verifier: String,
    expected_state: String,
}

#[derive(Debug, Clone, Copy)]
enum Renewal {
    /// Renew only if the bundle expires within the margin
    IfWithin(Duration),
    /// Renew even if the bundle looks fresh (provider rejected it)
    Force,
}

type TransitionFuture = BoxFuture<'static, Result<TokenBundle>>;
type Transition = Shared<TransitionFuture>;

struct Inner {
    config: SessionConfig,
    store: Arc<dyn CredentialStore>,
    exchange: Arc<dyn TokenExchange>,
    callback: Arc<dyn CallbackReceiver>,
    browser: Arc<dyn BrowserOpener>,
    cached: RwLock<Option<TokenBundle>>,
    flow: Mutex<Option<AuthFlowState>>,
    in_flight: Mutex<Option<WeakShared<TransitionFuture>>>,
    authorizing: AtomicBool,
}

/// Owns the session's token bundle and serializes its transitions.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn CredentialStore>,
        exchange: Arc<dyn TokenExchange>,
        callback: Arc<dyn CallbackReceiver>,
        browser: Arc<dyn BrowserOpener>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                exchange,
                callback,
                browser,
                cached: RwLock::new(None),
                flow: Mutex::new(None),
                in_flight: Mutex::new(None),
                authorizing: AtomicBool::new(false),
            }),
        }
    }

    /// Return a bundle that stays valid for at least the session margin,
    /// refreshing or authorizing as needed.
    pub async fn ensure_valid_session(&self) -> Result<TokenBundle> {
        self.ensure_valid_for(self.inner.config.session_margin).await
    }

    /// Same as `ensure_valid_session` with a caller-chosen margin.
    pub async fn ensure_valid_for(&self, margin: Duration) -> Result<TokenBundle> {
        if let Some(bundle) = self.inner.current().await?
            && is_fresh(&bundle, margin)
        {
            return Ok(bundle);
        }
        self.transition(Renewal::IfWithin(margin)).await
    }

    /// Renew the bundle even though it looks fresh.
    ///
    /// For callers whose token the provider just rejected.
    pub async fn revalidate(&self) -> Result<TokenBundle> {
        self.transition(Renewal::Force).await
    }

    pub fn state(&self) -> SessionState {
        if self.inner.authorizing.load(Ordering::Acquire) {
            return SessionState::Authorizing;
        }
        match self.inner.cached() {
            Some(bundle) if is_fresh(&bundle, Duration::ZERO) => SessionState::Authenticated,
            _ => SessionState::Unauthenticated,
        }
    }

    /// Whether PKCE material for an unfinished authorization is held.
    pub fn authorization_pending(&self) -> bool {
        self.inner
            .flow
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Forget the session: drop the cached bundle and delete the stored one.
    pub async fn sign_out(&self) -> Result<()> {
        self.inner.set_cached(None);
        let existed = self
            .inner
            .store
            .delete(&self.inner.config.service, &self.inner.config.account)
            .await?;
        info!(account = %self.inner.config.account, existed, "signed out");
        Ok(())
    }

    /// Join the pending transition, or start one.
    fn transition(&self, renewal: Renewal) -> Transition {
        let mut slot = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = slot.as_ref().and_then(WeakShared::upgrade) {
            debug!(?renewal, "joining in-flight session transition");
            return pending;
        }

        let inner = Arc::clone(&self.inner);
        let transition = async move {
            let outcome = inner.run_transition(renewal).await;
            inner
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            outcome
        }
        .boxed()
        .shared();
        *slot = transition.downgrade();
        transition
    }
}

fn is_fresh(bundle: &TokenBundle, margin: Duration) -> bool {
    bundle.has_access_token() && !bundle.expires_within(margin, now_millis())
}

/// Clears the authorizing flag however the authorization ends.
struct AuthorizingGuard<'a>(&'a AtomicBool);

impl<'a> AuthorizingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for AuthorizingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Forgets the PKCE material however the authorization ends.
struct FlowGuard<'a>(&'a Mutex<Option<AuthFlowState>>);

impl FlowGuard<'_> {
    fn take(&self) -> Option<AuthFlowState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        self.take();
    }
}

impl Inner {
    fn cached(&self) -> Option<TokenBundle> {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_cached(&self, bundle: Option<TokenBundle>) {
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = bundle;
    }

    /// Cached bundle, loading it from the store on first use.
    ///
    /// An unreadable blob counts as no bundle so the user can re-authorize
    /// over it; an unavailable store is an error.
    async fn current(&self) -> Result<Option<TokenBundle>> {
        if let Some(bundle) = self.cached() {
            return Ok(Some(bundle));
        }
        let blob = self
            .store
            .get(&self.config.service, &self.config.account)
            .await?;
        let bundle = blob.and_then(|blob| match TokenBundle::from_blob(&blob) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                warn!(account = %self.config.account, error = %e, "stored token bundle is unreadable, ignoring it");
                None
            }
        });
        if let Some(bundle) = &bundle {
            debug!(account = %self.config.account, expiry = bundle.expiry_epoch_millis, "loaded token bundle");
            self.set_cached(Some(bundle.clone()));
        }
        Ok(bundle)
    }

    async fn run_transition(&self, renewal: Renewal) -> Result<TokenBundle> {
        let current = self.current().await?;

        // Another transition may have finished while this one was queued
        if let (Renewal::IfWithin(margin), Some(bundle)) = (renewal, &current)
            && is_fresh(bundle, margin)
        {
            return Ok(bundle.clone());
        }

        let Some(bundle) = current.filter(TokenBundle::has_access_token) else {
            return self.authorize().await;
        };
        let Some(refresh_token) = bundle.refresh_token.clone() else {
            info!(account = %self.config.account, "bundle expiring without a refresh token, authorizing again");
            return self.authorize().await;
        };

        match self.refresh(&bundle, &refresh_token).await {
            Err(AuthError::InvalidGrant(reason)) => {
                warn!(account = %self.config.account, reason, "refresh token rejected, discarding stored bundle");
                self.set_cached(None);
                self.store
                    .delete(&self.config.service, &self.config.account)
                    .await?;
                self.authorize().await
            }
            outcome => outcome,
        }
    }

    async fn refresh(&self, current: &TokenBundle, refresh_token: &str) -> Result<TokenBundle> {
        let renewed = match self.exchange.refresh(refresh_token).await {
            Ok(renewed) => renewed.keeping_refresh_token_of(current),
            Err(e) => {
                let e = if matches!(e, AuthError::InvalidGrant(_) | AuthError::RefreshFailed(_)) {
                    e
                } else {
                    AuthError::RefreshFailed(e.to_string())
                };
                let outcome = if matches!(e, AuthError::InvalidGrant(_)) {
                    "invalid_grant"
                } else {
                    "transient"
                };
                metrics::counter!("session_refresh_total", "outcome" => outcome).increment(1);
                warn!(account = %self.config.account, error = %e, "token refresh failed");
                return Err(e);
            }
        };

        let bundle = self.persist(renewed).await?;
        metrics::counter!("session_refresh_total", "outcome" => "success").increment(1);
        info!(account = %self.config.account, expiry = bundle.expiry_epoch_millis, "access token refreshed");
        Ok(bundle)
    }

    async fn authorize(&self) -> Result<TokenBundle> {
        let _authorizing = AuthorizingGuard::enter(&self.authorizing);
        let outcome = self.run_authorization().await;
        let label = match &outcome {
            Ok(_) => "success",
            Err(AuthError::ProviderDenied(_)) => "denied",
            Err(AuthError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        metrics::counter!("session_authorize_total", "outcome" => label).increment(1);
        outcome
    }

    async fn run_authorization(&self) -> Result<TokenBundle> {
        let verifier = generate_verifier();
        let challenge = derive_challenge(&verifier);
        let flow = AuthFlowState {
            code_verifier: verifier,
            expected_state: generate_state(),
        };

        // Bind before showing anything so an occupied port fails quietly
        let pending = self.callback.listen(&flow.expected_state).await?;
        let redirect_uri = self.callback.redirect_uri();
        let url = build_authorization_url(
            &self.config.authorize_url,
            &self.config.client_id,
            &redirect_uri,
            &self.config.scopes,
            &flow.expected_state,
            &challenge,
        );
        *self.flow.lock().unwrap_or_else(PoisonError::into_inner) = Some(flow);
        let flow = FlowGuard(&self.flow);

        info!(account = %self.config.account, url = %url, "open this URL to authorize mail access");
        if let Err(e) = self.browser.open(&url) {
            warn!(error = %e, "could not open a browser, open the URL manually");
        }

        let code = pending.wait(self.config.consent_timeout).await;
        let flow = flow.take();
        let code = code?;
        let Some(flow) = flow else {
            return Err(AuthError::StateMismatch);
        };

        let bundle = self
            .exchange
            .exchange_code(&code, &flow.code_verifier, &redirect_uri)
            .await?;
        let bundle = self.persist(bundle).await?;
        info!(account = %self.config.account, "mail access authorized");
        Ok(bundle)
    }

    /// Write to the store, then cache. Nothing is handed out unpersisted.
    async fn persist(&self, bundle: TokenBundle) -> Result<TokenBundle> {
        self.store
            .put(&self.config.service, &self.config.account, &bundle.to_blob())
            .await?;
        self.set_cached(Some(bundle.clone()));
        Ok(bundle)
    }
}
