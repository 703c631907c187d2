//! Signed rate limit tokens.
//!
//! A token binds a client identifier, a request path and an issue time. It is
//! rendered as `base64url(payload) "." base64url(hmac_sha256(payload))`, which
//! survives embedding in a form field or a query string as plain text.

use std::net::{IpAddr, SocketAddr};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Length of a generated signing secret, in bytes.
const GENERATED_SECRET_LEN: usize = 32;

/// Errors produced while reading a token.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token is not of the form payload.signature")]
    Malformed,
    #[error("token is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("token signature does not verify")]
    BadSignature,
    #[error("token payload is unreadable: {0}")]
    Payload(#[from] serde_json::Error),
}

/// The data carried by a rate limit token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitToken {
    /// Client identifier the token was issued to
    #[serde(rename = "ip")]
    pub client_id: String,
    /// Path the token is valid for
    pub path: String,
    /// When the token was issued
    #[serde(rename = "ts")]
    pub issued_at: DateTime<Utc>,
}

/// Issues and verifies rate limit tokens with an HMAC-SHA256 secret.
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// Create a signer from a secret key.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Create a signer with a freshly generated random secret.
    ///
    /// Tokens issued by such a signer become unreadable once the process exits.
    pub fn generate() -> Self {
        let mut secret = vec![0u8; GENERATED_SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret }
    }

    fn mac(&self) -> HmacSha256 {
        // HMAC accepts keys of any length.
        HmacSha256::new_from_slice(&self.secret).expect("HMAC key of any length is valid")
    }

    /// Issue a token for `client_id` on `path` at time `now`.
    pub fn issue(&self, client_id: &str, path: &str, now: DateTime<Utc>) -> String {
        let token = RateLimitToken {
            client_id: client_id.to_string(),
            path: path.to_string(),
            issued_at: now,
        };
        self.encode(&token)
    }

    /// Issue a token while serving `request_path`.
    ///
    /// The token binds to `request_path` unless `target_path` names the path
    /// the form will be submitted to, e.g. a form rendered on one URL that
    /// posts to another.
    pub fn issue_for_request(
        &self,
        client_id: &str,
        request_path: &str,
        target_path: Option<&str>,
        now: DateTime<Utc>,
    ) -> String {
        self.issue(client_id, target_path.unwrap_or(request_path), now)
    }

    /// Encode and sign a token.
    pub fn encode(&self, token: &RateLimitToken) -> String {
        // Serializing a struct of strings and a timestamp cannot fail.
        let payload = serde_json::to_vec(token).unwrap_or_default();
        let mut mac = self.mac();
        mac.update(&payload);
        let signature = mac.finalize().into_bytes();

        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(signature)
        )
    }

    /// Verify a token's signature and recover its contents.
    ///
    /// Freshness and binding to the current request are not checked here.
    pub fn verify(&self, token: &str) -> Result<RateLimitToken, TokenError> {
        let (payload, signature) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let payload = URL_SAFE_NO_PAD.decode(payload)?;
        let signature = URL_SAFE_NO_PAD.decode(signature)?;

        let mut mac = self.mac();
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        Ok(serde_json::from_slice(&payload)?)
    }
}

/// Derive the client identifier from a peer address: the IP, without port.
pub fn client_id(addr: &SocketAddr) -> String {
    ip_string(addr.ip())
}

fn ip_string(ip: IpAddr) -> String {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        IpAddr::V4(v4) => v4.to_string(),
    }
}
