//! Core data types: provider metadata, token claims, and client tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// OIDC provider metadata from the discovery document.
///
/// Immutable once fetched; cached indefinitely in the state store and
/// assumed static for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct OpenIdConfig {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub end_session_endpoint: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub subject_types_supported: Vec<String>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

/// Decoded access-token payload.
///
/// `exp` and `iat` are seconds since the Unix epoch. `level` is the
/// security level the token authenticates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub client_id: String,
    pub sid: String,
    pub jti: String,
    #[serde(default)]
    pub perm: Vec<String>,
    pub level: i64,
    pub exp: i64,
    pub iat: i64,
}

/// An access token held by the client, with its refresh token and decoded
/// claims.
///
/// `expire_soon` is a terminal marker: once set, no further refresh is
/// attempted for this token value. A fresh login installs a new value and
/// clears it implicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientToken {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub decoded: TokenClaims,
    #[serde(default)]
    pub expire_soon: bool,
}

impl ClientToken {
    /// Milliseconds until this token expires, relative to `now_ms`.
    /// Negative once expired.
    #[must_use]
    pub fn remaining_ms(&self, now_ms: i64) -> i64 {
        self.decoded.exp * 1000 - now_ms
    }

    /// Granted lifetime in milliseconds.
    #[must_use]
    pub fn lifetime_ms(&self) -> i64 {
        (self.decoded.exp - self.decoded.iat) * 1000
    }

    /// Whether the token is unexpired at `now_ms`.
    #[must_use]
    pub fn is_live(&self, now_ms: i64) -> bool {
        self.remaining_ms(now_ms) > 0
    }
}

/// Token endpoint response (RFC 6749). `id_token` is present on the
/// authorization-code exchange, absent on refresh.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Decode the claims segment of a compact three-part access token.
///
/// The signature is *not* verified; validation is the resource server's
/// responsibility. Only the middle segment is base64url-decoded and parsed.
///
/// # Errors
/// Returns [`AuthError::Claims`] if the token is not three-part, the payload
/// is not base64url, or the JSON does not match [`TokenClaims`].
pub fn decode_claims(token: &str) -> Result<TokenClaims, AuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::Claims("not a three-part compact token".into()));
    }
    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|e| AuthError::Claims(format!("payload is not base64url: {e}")))?;
    serde_json::from_slice(&payload)
        .map_err(|e| AuthError::Claims(format!("payload is not valid claims JSON: {e}")))
}
