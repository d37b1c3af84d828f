//! OAuth session lifecycle for a single mail account
//!
//! Keeps one Google-style OAuth session alive for a long-running poller:
//! PKCE authorization through a local redirect listener, code exchange and
//! refresh through a backend that holds the client secret, and persistence
//! of the token bundle through a credential store. Every caller that needs
//! a credential goes through `SessionManager::ensure_valid_session()`.
//!
//! Session flow:
//! 1. `SessionManager` loads the bundle from the `CredentialStore`
//! 2. No bundle: `pkce::generate_verifier()` + `pkce::derive_challenge()`,
//!    open `pkce::build_authorization_url()` in the browser, wait on the
//!    `LocalCallbackListener`, exchange the code via `TokenExchange`
//! 3. Bundle close to expiry: `TokenExchange::refresh()`, keeping the old
//!    refresh token when the response omits one
//! 4. Refresh token revoked (`InvalidGrant`): delete the bundle, back to 2
//! 5. Every new bundle is written to the store before it is handed out

pub mod browser;
pub mod callback;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod pkce;
pub mod session;
pub mod token;

pub use browser::{BrowserOpener, SystemBrowser};
pub use callback::{CallbackReceiver, LocalCallbackListener, PendingCode, await_authorization_code};
pub use constants::*;
pub use credentials::{CredentialStore, FileCredentialStore};
pub use error::{AuthError, Result, StoreError};
pub use pkce::{build_authorization_url, derive_challenge, generate_state, generate_verifier};
pub use session::{SessionConfig, SessionManager, SessionState};
pub use token::{BackendTokenClient, TokenBundle, TokenExchange, TokenResponse, now_millis};
