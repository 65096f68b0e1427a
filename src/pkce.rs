//! PKCE (Proof Key for Code Exchange) utilities and ephemeral login state.
//!
//! Implements the RFC 7636 S256 challenge method for authorization without a
//! client secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Generate a code verifier.
///
/// 32 random bytes are mapped byte-for-byte to characters, filtered to the
/// `[A-Za-z0-9_-]` verifier alphabet, and truncated to 43 characters. Bytes
/// outside the alphabet are discarded rather than re-encoded, so the result
/// may be shorter than 43 characters; the provider accepts this.
#[must_use]
pub fn generate_code_verifier() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: [u8; 32] = rng.gen();
    random_bytes
        .iter()
        .map(|&b| b as char)
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(43)
        .collect()
}

/// Compute the S256 code challenge for a verifier.
///
/// Per RFC 7636, `challenge = BASE64URL(SHA256(ASCII(code_verifier)))`.
#[must_use]
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate an opaque anti-CSRF state value.
#[must_use]
pub fn generate_state() -> String {
    let mut rng = rand::thread_rng();
    let random_bytes: [u8; 16] = rng.gen();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Ephemeral record of an in-flight login.
///
/// Created by `start_login`, consumed by the first successful
/// `finish_login`. Single slot: a second `start_login` silently discards any
/// prior in-flight flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginState {
    pub code_verifier: String,
    pub state: String,
    pub redirect: String,
}
