//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The enrichment API token is loaded from ENRICHMENT_API_TOKEN or
//! api_token_file, never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub enrichment: Option<EnrichmentConfig>,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// OAuth client and token backend settings
#[derive(Debug, Deserialize)]
pub struct OAuthConfig {
    /// Also settable through OAUTH_CLIENT_ID, which wins
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    /// Backend endpoint trading an authorization code for tokens
    pub exchange_url: String,
    /// Backend endpoint trading a refresh token for tokens
    pub refresh_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_redirect_port")]
    pub redirect_port: u16,
    #[serde(default = "default_redirect_path")]
    pub redirect_path: String,
    #[serde(default = "default_consent_timeout")]
    pub consent_timeout_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_session_margin")]
    pub session_margin_secs: u64,
    #[serde(default = "default_call_margin")]
    pub call_margin_secs: u64,
}

#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_credentials_path")]
    pub path: PathBuf,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_account")]
    pub account: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

#[derive(Debug, Deserialize)]
pub struct MonitorSection {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Start monitoring as soon as the service is up
    #[serde(default = "default_true")]
    pub autostart: bool,
    #[serde(default = "default_authors_path")]
    pub authors_path: PathBuf,
}

/// Text analysis service used for summaries and tone
#[derive(Debug, Deserialize)]
pub struct EnrichmentConfig {
    pub url: String,
    #[serde(default)]
    pub summarize: bool,
    #[serde(default = "default_true")]
    pub tone: bool,
    #[serde(skip)]
    pub api_token: Option<Secret<String>>,
    /// Path to a file containing the API token (alternative to ENRICHMENT_API_TOKEN)
    #[serde(default)]
    pub api_token_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct NotificationsConfig {
    /// Desktop notifications; when false notifications are only logged
    #[serde(default = "default_true")]
    pub desktop: bool,
    #[serde(default = "default_true")]
    pub read_time: bool,
    #[serde(default = "default_true")]
    pub show_urgency: bool,
}

#[derive(Debug, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

fn default_authorize_url() -> String {
    oauth_session::AUTHORIZE_ENDPOINT.to_string()
}

fn default_scopes() -> Vec<String> {
    oauth_session::DEFAULT_SCOPES
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_redirect_port() -> u16 {
    oauth_session::DEFAULT_REDIRECT_PORT
}

fn default_redirect_path() -> String {
    oauth_session::DEFAULT_REDIRECT_PATH.to_string()
}

fn default_consent_timeout() -> u64 {
    oauth_session::CONSENT_TIMEOUT.as_secs()
}

fn default_http_timeout() -> u64 {
    30
}

fn default_session_margin() -> u64 {
    oauth_session::SESSION_REFRESH_MARGIN.as_secs()
}

fn default_call_margin() -> u64 {
    oauth_session::CALL_REFRESH_MARGIN.as_secs()
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_service() -> String {
    oauth_session::DEFAULT_SERVICE.to_string()
}

fn default_account() -> String {
    oauth_session::DEFAULT_ACCOUNT.to_string()
}

fn default_api_base_url() -> String {
    mail_api::gmail::GMAIL_API_BASE.to_string()
}

fn default_max_results() -> u32 {
    50
}

fn default_poll_interval() -> u64 {
    10
}

fn default_authors_path() -> PathBuf {
    PathBuf::from("notifiable_authors.json")
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    64
}

fn default_true() -> bool {
    true
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: default_credentials_path(),
            service: default_service(),
            account: default_account(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            max_results: default_max_results(),
        }
    }
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            autostart: true,
            authors_path: default_authors_path(),
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            desktop: true,
            read_time: true,
            show_urgency: true,
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
        }
    }
}

impl OAuthConfig {
    pub fn consent_timeout(&self) -> Duration {
        Duration::from_secs(self.consent_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn session_margin(&self) -> Duration {
        Duration::from_secs(self.session_margin_secs)
    }

    pub fn call_margin(&self) -> Duration {
        Duration::from_secs(self.call_margin_secs)
    }
}

impl MonitorSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn require_http_url(field: &str, value: &str) -> common::Result<()> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {value}"
        )));
    }
    Ok(())
}

fn require_non_zero(field: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Enrichment token resolution order:
    /// 1. ENRICHMENT_API_TOKEN env var
    /// 2. api_token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(client_id) = std::env::var("OAUTH_CLIENT_ID") {
            config.oauth.client_id = client_id;
        }

        if let Some(enrichment) = config.enrichment.as_mut() {
            if let Ok(token) = std::env::var("ENRICHMENT_API_TOKEN") {
                enrichment.api_token = Some(Secret::new(token));
            } else if let Some(ref token_file) = enrichment.api_token_file {
                let token = std::fs::read_to_string(token_file).map_err(|e| {
                    common::Error::Config(format!(
                        "failed to read api_token_file {}: {e}",
                        token_file.display()
                    ))
                })?;
                let token = token.trim().to_owned();
                if !token.is_empty() {
                    enrichment.api_token = Some(Secret::new(token));
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let oauth = &self.oauth;
        if oauth.client_id.trim().is_empty() {
            return Err(common::Error::Config(
                "oauth.client_id is required (or set OAUTH_CLIENT_ID)".into(),
            ));
        }
        require_http_url("authorize_url", &oauth.authorize_url)?;
        require_http_url("exchange_url", &oauth.exchange_url)?;
        require_http_url("refresh_url", &oauth.refresh_url)?;
        require_http_url("base_url", &self.api.base_url)?;
        if let Some(enrichment) = &self.enrichment {
            require_http_url("enrichment.url", &enrichment.url)?;
        }

        if !oauth.redirect_path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "redirect_path must start with '/', got: {}",
                oauth.redirect_path
            )));
        }

        require_non_zero("consent_timeout_secs", oauth.consent_timeout_secs)?;
        require_non_zero("http_timeout_secs", oauth.http_timeout_secs)?;
        require_non_zero("session_margin_secs", oauth.session_margin_secs)?;
        require_non_zero("poll_interval_secs", self.monitor.poll_interval_secs)?;
        require_non_zero("max_results", u64::from(self.api.max_results))?;

        if oauth.call_margin_secs > oauth.session_margin_secs {
            return Err(common::Error::Config(format!(
                "call_margin_secs ({}) must not exceed session_margin_secs ({})",
                oauth.call_margin_secs, oauth.session_margin_secs
            )));
        }

        if self.control.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("mail-notifier.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_overrides() {
        unsafe {
            remove_env("OAUTH_CLIENT_ID");
            remove_env("ENRICHMENT_API_TOKEN");
        }
    }

    const MINIMAL: &str = r#"
[oauth]
client_id = "1234.apps.googleusercontent.com"
exchange_url = "https://auth.example.com/api/auth/token"
refresh_url = "https://auth.example.com/api/auth/refresh"
"#;

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("mail-notifier.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn load_str(contents: &str) -> common::Result<Config> {
        let dir = tempfile::tempdir().unwrap();
        Config::load(&write_config(&dir, contents))
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();

        let config = load_str(MINIMAL).unwrap();
        assert_eq!(config.oauth.client_id, "1234.apps.googleusercontent.com");
        assert_eq!(config.oauth.authorize_url, oauth_session::AUTHORIZE_ENDPOINT);
        assert_eq!(config.oauth.redirect_port, 3000);
        assert_eq!(config.oauth.redirect_path, "/");
        assert_eq!(config.oauth.scopes.len(), 3);
        assert_eq!(config.oauth.consent_timeout(), Duration::from_secs(300));
        assert_eq!(config.oauth.session_margin(), Duration::from_secs(300));
        assert_eq!(config.oauth.call_margin(), Duration::from_secs(60));
        assert_eq!(config.credentials.path, PathBuf::from("credentials.json"));
        assert_eq!(config.credentials.service, "mail-notifier");
        assert_eq!(config.api.base_url, "https://gmail.googleapis.com");
        assert_eq!(config.api.max_results, 50);
        assert_eq!(config.monitor.poll_interval(), Duration::from_secs(10));
        assert!(config.monitor.autostart);
        assert!(config.enrichment.is_none());
        assert!(config.notifications.desktop);
        assert_eq!(config.control.listen_addr, "127.0.0.1:9090".parse::<SocketAddr>().unwrap());
        assert_eq!(config.control.max_connections, 64);
        assert!(!config.logging.json);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::load(Path::new("/nonexistent/mail-notifier.toml")).is_err());
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let result = load_str("not valid {{{{ toml");
        assert!(matches!(result, Err(common::Error::Toml(_))));
    }

    #[test]
    fn client_id_from_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        unsafe { set_env("OAUTH_CLIENT_ID", "from-env.apps.googleusercontent.com") };

        let config = load_str(MINIMAL).unwrap();
        assert_eq!(config.oauth.client_id, "from-env.apps.googleusercontent.com");
        clear_overrides();
    }

    #[test]
    fn missing_client_id_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();

        let err = load_str(
            r#"
[oauth]
exchange_url = "https://auth.example.com/token"
refresh_url = "https://auth.example.com/refresh"
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("client_id"), "got: {err}");
    }

    #[test]
    fn enrichment_token_from_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("analyzer_token");
        std::fs::write(&token_path, "hf_file_token\n").unwrap();

        let path = write_config(
            &dir,
            &format!(
                "{MINIMAL}\n[enrichment]\nurl = \"http://127.0.0.1:5000\"\napi_token_file = \"{}\"\n",
                token_path.display()
            ),
        );
        let config = Config::load(&path).unwrap();
        let enrichment = config.enrichment.unwrap();
        assert_eq!(enrichment.api_token.unwrap().expose(), "hf_file_token");
        assert!(!enrichment.summarize);
        assert!(enrichment.tone);
    }

    #[test]
    fn enrichment_token_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();
        unsafe { set_env("ENRICHMENT_API_TOKEN", "hf_env_token") };

        let config = load_str(&format!(
            "{MINIMAL}\n[enrichment]\nurl = \"http://127.0.0.1:5000\"\napi_token_file = \"/nonexistent/token\"\n"
        ))
        .unwrap();
        assert_eq!(
            config.enrichment.unwrap().api_token.unwrap().expose(),
            "hf_env_token"
        );
        clear_overrides();
    }

    #[test]
    fn missing_token_file_is_an_error() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();

        let result = load_str(&format!(
            "{MINIMAL}\n[enrichment]\nurl = \"http://127.0.0.1:5000\"\napi_token_file = \"/nonexistent/token\"\n"
        ));
        assert!(result.is_err());
    }

    #[test]
    fn url_without_scheme_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();

        let err = load_str(&format!("{MINIMAL}\n[api]\nbase_url = \"gmail.googleapis.com\"\n"))
            .unwrap_err();
        assert!(
            err.to_string().contains("base_url must start with http"),
            "error message should explain the issue, got: {err}"
        );
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();

        let result = load_str(&format!("{MINIMAL}\n[monitor]\npoll_interval_secs = 0\n"));
        assert!(result.is_err(), "poll_interval_secs = 0 must be rejected");
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();

        let result = load_str(&format!("{MINIMAL}\n[control]\nmax_connections = 0\n"));
        assert!(result.is_err(), "max_connections = 0 must be rejected");
    }

    #[test]
    fn call_margin_larger_than_session_margin_is_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();

        let contents = MINIMAL.replace(
            "[oauth]\n",
            "[oauth]\nsession_margin_secs = 60\ncall_margin_secs = 120\n",
        );
        let err = load_str(&contents).unwrap_err();
        assert!(err.to_string().contains("call_margin_secs"), "got: {err}");
    }

    #[test]
    fn redirect_path_must_be_absolute() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_overrides();

        let contents = MINIMAL.replace("[oauth]\n", "[oauth]\nredirect_path = \"callback\"\n");
        assert!(load_str(&contents).is_err());
    }

    #[test]
    fn resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("mail-notifier.toml"));
    }

    #[test]
    fn resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
