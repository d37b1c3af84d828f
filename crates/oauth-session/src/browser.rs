//! Opening the authorization URL for the user

use crate::error::AuthError;

/// Shows the authorization URL to the user.
pub trait BrowserOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<(), AuthError>;
}

/// Opens URLs in the system's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> Result<(), AuthError> {
        opener::open_browser(url).map_err(|e| AuthError::Browser(e.to_string()))
    }
}
