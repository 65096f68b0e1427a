//! Error types for the session manager.
//!
//! Discovery and code-exchange failures propagate to the caller; refresh
//! failures are recovered locally by the refresh engine (the affected token
//! is left to die at its natural expiry) and only logged.

/// Error type for all session manager operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Discovery or token endpoint unreachable, or a response body that
    /// could not be parsed.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// A provider endpoint URL could not be parsed or composed.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// `finish_login` was called with no login flow in progress.
    #[error("no login flow in progress")]
    MissingLoginState,

    /// State parameter mismatch (possible CSRF or stale callback).
    #[error("state mismatch: expected {expected}, received {received}")]
    StateMismatch { expected: String, received: String },

    /// The authorization-code exchange returned a non-success status.
    #[error("token exchange failed with status {status}: {detail}")]
    TokenExchangeFailed { status: u16, detail: String },

    /// The refresh grant returned a non-success status. Recovered locally by
    /// dropping the refresh token from the affected entry.
    #[error("token refresh failed with status {status}: {detail}")]
    RefreshFailed { status: u16, detail: String },

    /// An access token payload could not be decoded as claims JSON.
    #[error("token claims could not be decoded: {0}")]
    Claims(String),

    /// The state store backend failed.
    #[error("state store error: {0}")]
    Storage(String),

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}
