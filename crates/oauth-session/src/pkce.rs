//! PKCE (Proof Key for Code Exchange) implementation per RFC 7636
//!
//! Generates the code verifier and S256 challenge for the authorization code
//! flow, plus the anti-forgery `state` token that protects the local redirect.
//! The verifier never leaves this process except in the code exchange request;
//! the challenge goes into the authorization URL so the provider can check the
//! exchange came from whoever started the flow.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use reqwest::Url;
use sha2::{Digest, Sha256};

/// Random bytes behind each verifier and state token (256 bits).
const ENTROPY_BYTES: usize = 32;

fn random_token() -> String {
    let mut bytes = [0u8; ENTROPY_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a cryptographically random PKCE code verifier.
///
/// 32 random bytes as URL-safe base64 without padding: 43 characters, the
/// minimum length RFC 7636 allows, carrying 256 bits of entropy.
pub fn generate_verifier() -> String {
    random_token()
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`, no padding.
pub fn derive_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate the `state` parameter for one authorization round trip.
///
/// Independent of the verifier so leaking one says nothing about the other.
pub fn generate_state() -> String {
    random_token()
}

/// Build the authorization URL the user opens in the browser.
///
/// `access_type=offline` and `prompt=consent` make Google issue a refresh
/// token on every consent, not only the first one.
pub fn build_authorization_url(
    authorize_url: &Url,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
    challenge: &str,
) -> String {
    let mut url = authorize_url.clone();
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("scope", &scopes.join(" "))
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("state", state)
        .append_pair("access_type", "offline")
        .append_pair("prompt", "consent");
    url.to_string()
}
