//! OAuth defaults for a Gmail desktop client
//!
//! Only the public side of the client lives here. The client secret stays on
//! the token backend; this process holds the client id and, for the length of
//! one authorization round trip, the PKCE verifier.

use std::time::Duration;

/// Google's OAuth 2.0 authorization endpoint
pub const AUTHORIZE_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Gmail scopes: read messages, change labels (mark read), list labels
pub const DEFAULT_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/gmail.labels",
];

/// Local port the redirect listener binds
pub const DEFAULT_REDIRECT_PORT: u16 = 3000;

/// Path the provider redirects to on the local listener
pub const DEFAULT_REDIRECT_PATH: &str = "/";

/// Credential store service key
pub const DEFAULT_SERVICE: &str = "mail-notifier";

/// Credential store account key
pub const DEFAULT_ACCOUNT: &str = "default";

/// Refresh margin applied when a session is (re)checked
pub const SESSION_REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

/// Tighter margin applied right before a provider API call
pub const CALL_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// How long the user gets to finish the consent screen
pub const CONSENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
