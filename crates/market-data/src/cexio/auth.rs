//! HMAC-SHA256 signing of the authentication handshake.
//!
//! The exchange expects `HMAC-SHA256(secret, "<unix seconds><api key>")`
//! rendered as lowercase hex. Uses `ring` for the HMAC. Secrets are never
//! logged or included in error messages.

use ring::hmac;

use super::message::Request;
use super::types::AuthFields;

/// Holds the API credentials and produces signed `auth` requests.
#[derive(Clone)]
pub struct Authenticator {
    api_key: String,
    key: hmac::Key,
}

impl Authenticator {
    pub fn new(api_key: impl Into<String>, api_secret: &str) -> Self {
        Self {
            api_key: api_key.into(),
            key: hmac::Key::new(hmac::HMAC_SHA256, api_secret.as_bytes()),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Signature over `timestamp` (Unix seconds) and the API key.
    pub fn sign(&self, timestamp: i64) -> String {
        let payload = format!("{}{}", timestamp, self.api_key);
        let signature = hmac::sign(&self.key, payload.as_bytes());
        hex::encode(signature.as_ref())
    }

    /// Handshake request signed at an explicit time.
    pub fn build_auth_request_at(&self, timestamp: i64) -> Request {
        Request::Auth(AuthFields {
            key: self.api_key.clone(),
            signature: self.sign(timestamp),
            timestamp,
        })
    }

    /// Handshake request signed at the current wall-clock second.
    pub fn build_auth_request(&self) -> Request {
        self.build_auth_request_at(chrono::Utc::now().timestamp())
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}
