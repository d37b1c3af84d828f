//! Mail notifier
//!
//! Single-binary service that:
//! 1. Keeps an OAuth session to the mail account alive
//! 2. Polls for unread mail and notifies for new messages from notifiable authors
//! 3. Serves a local control API for authorization, monitoring and authors

mod analyzer;
mod config;
mod control;
mod error;
mod metrics;
mod notifier;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use inbox_monitor::{
    DispatchSettings, Dispatcher, Enricher, Monitor, MonitorConfig, NotifiableAuthors, Notifier,
};
use mail_api::{ApiGate, GmailClient, MailApi};
use oauth_session::{
    BackendTokenClient, FileCredentialStore, LocalCallbackListener, SessionConfig, SessionManager,
    SystemBrowser,
};

use crate::analyzer::HttpTextAnalyzer;
use crate::config::Config;
use crate::control::{ControlState, build_control_router};
use crate::notifier::{DesktopNotifier, LogNotifier};

/// How long in-flight control requests get after the shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a running poll tick gets to finish on shutdown.
const TICK_GRACE: Duration = Duration::from_secs(10);

/// Initialize tracing with LOG_LEVEL / RUST_LOG support.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn dispatch_settings(config: &Config) -> DispatchSettings {
    let enrichment = config.enrichment.as_ref();
    DispatchSettings {
        summarize: enrichment.is_some_and(|e| e.summarize),
        tone: enrichment.is_some_and(|e| e.tone),
        read_time: config.notifications.read_time,
    }
}

fn session_config(config: &Config) -> Result<SessionConfig> {
    let oauth = &config.oauth;
    let authorize_url = Url::parse(&oauth.authorize_url)
        .with_context(|| format!("invalid authorize_url {}", oauth.authorize_url))?;
    let mut session = SessionConfig::new(oauth.client_id.clone(), authorize_url);
    session.scopes = oauth.scopes.clone();
    session.service = config.credentials.service.clone();
    session.account = config.credentials.account.clone();
    session.session_margin = oauth.session_margin();
    session.consent_timeout = oauth.consent_timeout();
    Ok(session)
}

fn build_enricher(config: &Config, http: &reqwest::Client) -> Result<Option<Arc<dyn Enricher>>> {
    let Some(enrichment) = &config.enrichment else {
        return Ok(None);
    };
    let url = Url::parse(&enrichment.url)
        .with_context(|| format!("invalid enrichment url {}", enrichment.url))?;
    Ok(Some(Arc::new(HttpTextAnalyzer::new(
        http.clone(),
        url,
        enrichment.api_token.clone(),
    ))))
}

fn build_notifier(config: &Config) -> Arc<dyn Notifier> {
    if config.notifications.desktop {
        Arc::new(DesktopNotifier::new(config.notifications.show_urgency))
    } else {
        Arc::new(LogNotifier::new())
    }
}

/// Authorize if needed, then start monitoring.
///
/// A failed authorization leaves monitoring stopped so the poller doesn't
/// reopen the consent screen every tick; the user retries through
/// `POST /session/authorize` and `POST /monitoring/start`.
async fn autostart(monitor: Monitor) {
    if let Err(e) = monitor.gate().session().ensure_valid_session().await {
        warn!(error = %e, "{}", e.user_message());
        return;
    }
    match monitor.start().await {
        Ok(outcome) => info!(status = outcome.label(), "monitoring autostart"),
        Err(e) => error!(error = %e, "monitoring autostart failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    init_tracing(config.logging.json);
    info!(path = %config_path.display(), "starting mail-notifier");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    info!(
        listen_addr = %config.control.listen_addr,
        api_base_url = %config.api.base_url,
        redirect_port = config.oauth.redirect_port,
        poll_interval_secs = config.monitor.poll_interval_secs,
        enrichment = config.enrichment.is_some(),
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(config.oauth.http_timeout())
        .build()
        .context("failed to build HTTP client")?;

    let session = SessionManager::new(
        session_config(&config)?,
        Arc::new(FileCredentialStore::new(config.credentials.path.clone())),
        Arc::new(BackendTokenClient::new(
            http.clone(),
            &config.oauth.exchange_url,
            &config.oauth.refresh_url,
        )),
        Arc::new(LocalCallbackListener::new(
            config.oauth.redirect_port,
            config.oauth.redirect_path.clone(),
        )),
        Arc::new(SystemBrowser),
    );

    let base_url = Url::parse(&config.api.base_url)
        .with_context(|| format!("invalid api base_url {}", config.api.base_url))?;
    let api: Arc<dyn MailApi> = Arc::new(GmailClient::new(http.clone(), base_url));

    let authors = Arc::new(NotifiableAuthors::load(config.monitor.authors_path.clone()).await);
    let dispatcher = Dispatcher::new(
        authors,
        build_enricher(&config, &http)?,
        build_notifier(&config),
        dispatch_settings(&config),
    );

    let monitor = Monitor::new(
        ApiGate::new(session, config.oauth.call_margin()),
        api.clone(),
        dispatcher,
        MonitorConfig {
            poll_interval: config.monitor.poll_interval(),
            max_results: config.api.max_results,
        },
    );

    let app = build_control_router(
        ControlState::new(monitor.clone(), api, prometheus_handle),
        config.control.max_connections,
    );

    let listen_addr = config.control.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "control API listening");

    if config.monitor.autostart {
        tokio::spawn(autostart(monitor.clone()));
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Stop polling first so no new provider calls start during the drain
    monitor.shutdown(TICK_GRACE).await;

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("control API drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[oauth]
client_id = "1234.apps.googleusercontent.com"
exchange_url = "https://auth.example.com/token"
refresh_url = "https://auth.example.com/refresh"
"#;

    fn parse(extra: &str) -> Config {
        toml::from_str(&format!("{BASE}{extra}")).unwrap()
    }

    #[test]
    fn no_enrichment_section_disables_summary_and_tone() {
        let config = parse("");
        assert_eq!(
            dispatch_settings(&config),
            DispatchSettings {
                summarize: false,
                tone: false,
                read_time: true,
            }
        );
        assert!(build_enricher(&config, &reqwest::Client::new()).unwrap().is_none());
    }

    #[test]
    fn enrichment_section_enables_configured_analyses() {
        let config = parse(
            "\n[enrichment]\nurl = \"http://127.0.0.1:5000\"\nsummarize = true\n\n[notifications]\nread_time = false\n",
        );
        assert_eq!(
            dispatch_settings(&config),
            DispatchSettings {
                summarize: true,
                tone: true,
                read_time: false,
            }
        );
        assert!(build_enricher(&config, &reqwest::Client::new()).unwrap().is_some());
    }

    #[test]
    fn session_config_carries_credentials_keys_and_margins() {
        let config = parse(
            "\n[credentials]\nservice = \"work-mail\"\naccount = \"me\"\n",
        );
        let session = session_config(&config).unwrap();
        assert_eq!(session.client_id, "1234.apps.googleusercontent.com");
        assert_eq!(session.service, "work-mail");
        assert_eq!(session.account, "me");
        assert_eq!(session.session_margin, Duration::from_secs(300));
        assert_eq!(session.scopes.len(), 3);
    }

    #[test]
    fn invalid_enrichment_url_is_a_startup_error() {
        let config = parse("\n[enrichment]\nurl = \"http://\"\n");
        assert!(build_enricher(&config, &reqwest::Client::new()).is_err());
    }
}
