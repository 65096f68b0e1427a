//! Client-side OAuth2 session manager with stacked security levels.
//!
//! Implements the Authorization Code + PKCE flow against an OIDC provider
//! and maintains a stack of access tokens, one per security level, in a
//! shared persisted store. Tokens refresh themselves past the half-life of
//! their lifetime, rotate superseded values through a cached pool for other
//! audiences, and die at expiry; the effective security level is always
//! derived from what is live, never set independently.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use stacked_auth::{AuthConfig, LocalLock, MemoryStore, SessionManager, StartLoginOptions};
//!
//! # async fn run() -> Result<(), stacked_auth::AuthError> {
//! let config = AuthConfig::new(
//!     "https://id.example.com".parse()?,
//!     "client-app",
//!     "server-app",
//!     "issuer-app",
//!     "https://app.example.com".parse()?,
//! );
//! let manager = SessionManager::new(
//!     config,
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(LocalLock::new()),
//! );
//!
//! let url = manager.start_login("/home", StartLoginOptions::default()).await?;
//! // Navigate the user to `url`; on callback:
//! // let redirect = manager.finish_login(&code, &state).await?;
//!
//! let token = manager.get_auth_token(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod pkce;
pub mod session;
pub mod storage;
pub mod types;

mod discovery;
mod http;
mod refresh;
mod store;

pub use config::{AuthConfig, DEFAULT_CALLBACK_PATH, DEFAULT_LOGOUT_PATH};
pub use error::AuthError;
pub use pkce::{generate_code_challenge, generate_code_verifier, generate_state, LoginState};
pub use session::{
    LogoutOptions, LogoutRequest, Permission, SessionManager, StartLoginOptions,
};
pub use storage::{LocalLock, LockGuard, MemoryStore, SessionLock, StateStore};
pub use types::{decode_claims, ClientToken, OpenIdConfig, TokenClaims, TokenResponse};
