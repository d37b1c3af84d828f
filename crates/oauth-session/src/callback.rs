//! Single-use local HTTP listener for the OAuth redirect
//!
//! Binds one port on the loopback interface, answers exactly one request on
//! the redirect path, then shuts itself down so the port is free for the
//! next flow. The `state` parameter is checked before the `code` is trusted.

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{AuthError, Result};

/// Time the server gets to flush the final page and release the port.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const SUCCESS_PAGE: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Authorized</title></head>\
<body><h1>Authentication successful</h1><p>You can close this window and return to the mail notifier.</p></body></html>";

fn failure_page(reason: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Authorization failed</title></head>\
<body><h1>Authentication error</h1><p>{reason}</p><p>Please close this window and try again.</p></body></html>"
    )
}

/// Query parameters the provider appends to the redirect.
#[derive(Debug, Default, Deserialize)]
pub struct RedirectParams {
    pub code: Option<String>,
    pub error: Option<String>,
    pub state: Option<String>,
}

/// Decide the outcome of a redirect.
///
/// Order matters: a provider error wins, then the state check, and only then
/// is the code looked at.
pub fn classify_redirect(expected_state: &str, params: RedirectParams) -> Result<String> {
    if let Some(error) = params.error {
        return Err(AuthError::ProviderDenied(error));
    }
    match params.state.as_deref() {
        Some(state) if state == expected_state => {}
        _ => return Err(AuthError::StateMismatch),
    }
    match params.code {
        Some(code) if !code.is_empty() => Ok(code),
        _ => Err(AuthError::MissingCode),
    }
}

/// Listener bound and waiting for its one redirect.
///
/// Dropping it before the redirect arrives stops the listener.
pub struct PendingCode {
    port: u16,
    result: oneshot::Receiver<Result<String>>,
    server: Option<JoinHandle<()>>,
}

impl PendingCode {
    /// A pending code that resolves immediately, for receivers that don't
    /// need a listener.
    pub fn ready(outcome: Result<String>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self {
            port: 0,
            result: rx,
            server: None,
        }
    }

    /// Port the listener actually bound (useful when bound to port 0).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the redirect, giving up after `timeout`.
    ///
    /// The listener is shut down before this returns, whatever the outcome.
    pub async fn wait(mut self, timeout: Duration) -> Result<String> {
        let outcome = match tokio::time::timeout(timeout, &mut self.result).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AuthError::Listener("callback listener stopped".into())),
            Err(_) => Err(AuthError::Timeout("authorization redirect".into())),
        };

        if let Some(mut server) = self.server.take() {
            let timed_out = matches!(outcome, Err(AuthError::Timeout(_)));
            if timed_out || tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
                server.abort();
                let _ = server.await;
            }
        }
        debug!(port = self.port, "callback listener closed");
        outcome
    }
}

impl Drop for PendingCode {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

/// Source of authorization codes for the session manager.
pub trait CallbackReceiver: Send + Sync {
    /// Redirect URI registered with the provider for this receiver.
    fn redirect_uri(&self) -> String;

    /// Start listening for a redirect carrying `expected_state`.
    ///
    /// Must fail fast (e.g. `PortInUse`) so nothing is shown to the user for
    /// a flow that can't complete.
    fn listen<'a>(
        &'a self,
        expected_state: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<PendingCode>> + Send + 'a>>;
}

struct ListenerState {
    expected_state: String,
    sender: Mutex<Option<oneshot::Sender<Result<String>>>>,
    done: Arc<Notify>,
}

async fn handle_redirect(
    State(state): State<Arc<ListenerState>>,
    Query(params): Query<RedirectParams>,
) -> Response {
    let sender = state
        .sender
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    let Some(sender) = sender else {
        return (
            StatusCode::GONE,
            Html(failure_page("This authorization request was already handled.")),
        )
            .into_response();
    };

    let outcome = classify_redirect(&state.expected_state, params);
    let (status, page) = match &outcome {
        Ok(_) => (StatusCode::OK, SUCCESS_PAGE.to_string()),
        // The provider's reason is logged, never rendered
        Err(AuthError::ProviderDenied(_)) => (
            StatusCode::BAD_REQUEST,
            failure_page("Access to the mailbox was not granted."),
        ),
        Err(AuthError::StateMismatch) => (
            StatusCode::BAD_REQUEST,
            failure_page("The request did not match the sign-in that was started."),
        ),
        Err(_) => (
            StatusCode::BAD_REQUEST,
            failure_page("Missing authorization code."),
        ),
    };

    match &outcome {
        Ok(_) => info!("authorization redirect received"),
        Err(e) => warn!(error = %e, "authorization redirect rejected"),
    }
    let _ = sender.send(outcome);
    state.done.notify_one();

    (status, [(header::CONNECTION, "close")], Html(page)).into_response()
}

/// Loopback redirect listener on a fixed port and path.
#[derive(Debug, Clone)]
pub struct LocalCallbackListener {
    port: u16,
    path: String,
}

impl LocalCallbackListener {
    pub fn new(port: u16, path: impl Into<String>) -> Self {
        Self {
            port,
            path: path.into(),
        }
    }

    /// Bind the port and serve the redirect path until one request arrives.
    pub async fn bind(&self, expected_state: &str) -> Result<PendingCode> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, self.port))
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AddrInUse {
                    AuthError::PortInUse(self.port)
                } else {
                    AuthError::Listener(format!("binding port {}: {e}", self.port))
                }
            })?;
        let port = listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.port);

        let (tx, rx) = oneshot::channel();
        let done = Arc::new(Notify::new());
        let state = Arc::new(ListenerState {
            expected_state: expected_state.to_string(),
            sender: Mutex::new(Some(tx)),
            done: done.clone(),
        });
        let app = Router::new()
            .route(&self.path, get(handle_redirect))
            .with_state(state);

        let server = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { done.notified().await })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "callback listener failed");
            }
        });

        debug!(port, path = %self.path, "callback listener bound");
        Ok(PendingCode {
            port,
            result: rx,
            server: Some(server),
        })
    }
}

impl CallbackReceiver for LocalCallbackListener {
    fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, self.path)
    }

    fn listen<'a>(
        &'a self,
        expected_state: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<PendingCode>> + Send + 'a>> {
        Box::pin(self.bind(expected_state))
    }
}

/// Bind, wait for the one redirect, and close.
///
/// One-shot form of `LocalCallbackListener` for callers that open the
/// browser themselves before awaiting.
pub async fn await_authorization_code(
    expected_state: &str,
    port: u16,
    path: &str,
    timeout: Duration,
) -> Result<String> {
    LocalCallbackListener::new(port, path)
        .bind(expected_state)
        .await?
        .wait(timeout)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(code: Option<&str>, error: Option<&str>, state: Option<&str>) -> RedirectParams {
        RedirectParams {
            code: code.map(str::to_string),
            error: error.map(str::to_string),
            state: state.map(str::to_string),
        }
    }

    #[test]
    fn matching_state_yields_code() {
        let outcome = classify_redirect("s1", params(Some("4/0abc"), None, Some("s1")));
        assert_eq!(outcome.unwrap(), "4/0abc");
    }

    #[test]
    fn mismatched_state_rejected_even_with_code() {
        let outcome = classify_redirect("s1", params(Some("4/0abc"), None, Some("forged")));
        assert!(matches!(outcome, Err(AuthError::StateMismatch)));
    }

    #[test]
    fn absent_state_rejected() {
        let outcome = classify_redirect("s1", params(Some("4/0abc"), None, None));
        assert!(matches!(outcome, Err(AuthError::StateMismatch)));
    }

    #[test]
    fn provider_error_is_denial() {
        let outcome = classify_redirect("s1", params(None, Some("access_denied"), Some("s1")));
        match outcome {
            Err(AuthError::ProviderDenied(reason)) => assert_eq!(reason, "access_denied"),
            other => panic!("expected ProviderDenied, got {other:?}"),
        }
    }

    #[test]
    fn valid_state_without_code_is_missing_code() {
        let outcome = classify_redirect("s1", params(None, None, Some("s1")));
        assert!(matches!(outcome, Err(AuthError::MissingCode)));
    }

    async fn listen_ephemeral(expected_state: &str) -> PendingCode {
        LocalCallbackListener::new(0, "/")
            .bind(expected_state)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn redirect_with_matching_state_resolves_code() {
        let pending = listen_ephemeral("state-1").await;
        let port = pending.port();

        let response = reqwest::get(format!(
            "http://127.0.0.1:{port}/?code=4%2F0code&state=state-1&scope=gmail"
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.text().await.unwrap().contains("successful"));

        let code = pending.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, "4/0code");
    }

    #[tokio::test]
    async fn redirect_with_forged_state_fails_page_and_result() {
        let pending = listen_ephemeral("state-1").await;
        let port = pending.port();

        let response = reqwest::get(format!("http://127.0.0.1:{port}/?code=c&state=other"))
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        let err = pending.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, AuthError::StateMismatch));
    }

    #[tokio::test]
    async fn redirect_with_error_is_denied() {
        let pending = listen_ephemeral("state-1").await;
        let port = pending.port();

        let response = reqwest::get(format!(
            "http://127.0.0.1:{port}/?error=access_denied&state=state-1"
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), 400);

        let err = pending.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, AuthError::ProviderDenied(_)));
    }

    #[tokio::test]
    async fn error_parameter_is_not_echoed_into_the_page() {
        let pending = listen_ephemeral("state-1").await;
        let port = pending.port();

        let response = reqwest::get(format!(
            "http://127.0.0.1:{port}/?error=%3Cscript%3Ealert(1)%3C%2Fscript%3E&state=state-1"
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), 400);
        let page = response.text().await.unwrap();
        assert!(!page.contains("<script>"), "got: {page}");
        assert!(page.contains("not granted"));

        match pending.wait(Duration::from_secs(5)).await {
            Err(AuthError::ProviderDenied(reason)) => assert_eq!(reason, "<script>alert(1)</script>"),
            other => panic!("expected ProviderDenied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn occupied_port_fails_fast() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        let err = LocalCallbackListener::new(port, "/")
            .bind("state")
            .await
            .err()
            .unwrap();
        match err {
            AuthError::PortInUse(p) => assert_eq!(p, port),
            other => panic!("expected PortInUse, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn port_is_released_after_first_redirect() {
        let pending = listen_ephemeral("state-1").await;
        let port = pending.port();

        reqwest::get(format!("http://127.0.0.1:{port}/?code=c&state=state-1"))
            .await
            .unwrap();
        pending.wait(Duration::from_secs(5)).await.unwrap();

        let again = LocalCallbackListener::new(port, "/").bind("state-2").await;
        assert!(again.is_ok(), "port {port} should be free for the next flow");
    }

    #[tokio::test]
    async fn unrelated_path_does_not_consume_listener() {
        let pending = listen_ephemeral("state-1").await;
        let port = pending.port();

        let favicon = reqwest::get(format!("http://127.0.0.1:{port}/favicon.ico"))
            .await
            .unwrap();
        assert_eq!(favicon.status(), 404);

        reqwest::get(format!("http://127.0.0.1:{port}/?code=c&state=state-1"))
            .await
            .unwrap();
        assert_eq!(pending.wait(Duration::from_secs(5)).await.unwrap(), "c");
    }

    #[tokio::test]
    async fn no_redirect_times_out() {
        let pending = listen_ephemeral("state-1").await;
        let err = pending
            .wait(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Timeout(_)));
    }

    #[tokio::test]
    async fn ready_pending_code_resolves_without_listener() {
        let code = PendingCode::ready(Ok("c".into()))
            .wait(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(code, "c");
    }

    #[tokio::test]
    async fn await_authorization_code_resolves_on_fixed_port() {
        let port = {
            let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            scratch.local_addr().unwrap().port()
        };
        let waiting = tokio::spawn(async move {
            await_authorization_code("state-9", port, "/oauth2callback", Duration::from_secs(5)).await
        });

        let url = format!("http://127.0.0.1:{port}/oauth2callback?code=c9&state=state-9");
        let mut delivered = false;
        for _ in 0..50 {
            if reqwest::get(&url).await.is_ok() {
                delivered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(delivered, "listener on port {port} never answered");
        assert_eq!(waiting.await.unwrap().unwrap(), "c9");
    }

    #[tokio::test]
    async fn await_authorization_code_reports_occupied_port() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        let err = await_authorization_code("state", port, "/", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::PortInUse(p) if p == port));
    }
}
