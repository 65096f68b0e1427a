//! Session manager configuration.
//!
//! Carries the identity provider location and the three application
//! identifiers used in permission-scope templates, plus the origin the
//! default callback and logout redirect URIs are resolved against.

use url::Url;

use crate::error::AuthError;

/// Default redirect path the provider sends the authorization code to.
pub const DEFAULT_CALLBACK_PATH: &str = "/auth/callback";

/// Default post-logout redirect path.
pub const DEFAULT_LOGOUT_PATH: &str = "/auth/logout";

/// Configuration for a [`SessionManager`](crate::session::SessionManager).
///
/// Required fields are constructor parameters. Optional paths use fixed
/// application defaults and can be overridden with `with_*` methods.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub(crate) issuer: Url,
    pub(crate) client_app_id: String,
    pub(crate) server_app_id: String,
    pub(crate) issuer_app_id: String,
    pub(crate) origin: Url,
    pub(crate) callback_path: String,
    pub(crate) logout_path: String,
}

impl AuthConfig {
    /// Create a new configuration.
    ///
    /// # Arguments
    /// * `issuer` - Identity provider base URL (discovery is resolved
    ///   against it)
    /// * `client_app_id` - OAuth client identifier of this application
    /// * `server_app_id` - Resource-server application identifier
    /// * `issuer_app_id` - Identity provider's own application identifier
    /// * `origin` - Base URL default redirect URIs are resolved against
    #[must_use]
    pub fn new(
        issuer: Url,
        client_app_id: impl Into<String>,
        server_app_id: impl Into<String>,
        issuer_app_id: impl Into<String>,
        origin: Url,
    ) -> Self {
        Self {
            issuer,
            client_app_id: client_app_id.into(),
            server_app_id: server_app_id.into(),
            issuer_app_id: issuer_app_id.into(),
            origin,
            callback_path: DEFAULT_CALLBACK_PATH.to_string(),
            logout_path: DEFAULT_LOGOUT_PATH.to_string(),
        }
    }

    /// Create a configuration from environment variables.
    ///
    /// # Required env vars
    /// - `AUTH_ISSUER`: identity provider base URL
    /// - `AUTH_CLIENT_APP_ID`: OAuth client identifier
    /// - `AUTH_SERVER_APP_ID`: resource-server application identifier
    /// - `AUTH_ISSUER_APP_ID`: provider application identifier
    /// - `AUTH_ORIGIN`: base URL for default redirect URIs
    ///
    /// # Errors
    /// Returns [`AuthError::Config`] if a required variable is missing or a
    /// URL does not parse.
    pub fn from_env() -> Result<Self, AuthError> {
        fn var(name: &str) -> Result<String, AuthError> {
            std::env::var(name).map_err(|_| AuthError::Config(format!("{name} is required")))
        }
        fn var_url(name: &str) -> Result<Url, AuthError> {
            var(name)?.parse().map_err(|e| AuthError::Config(format!("{name}: {e}")))
        }

        Ok(Self::new(
            var_url("AUTH_ISSUER")?,
            var("AUTH_CLIENT_APP_ID")?,
            var("AUTH_SERVER_APP_ID")?,
            var("AUTH_ISSUER_APP_ID")?,
            var_url("AUTH_ORIGIN")?,
        ))
    }

    /// Override the callback redirect path.
    #[must_use]
    pub fn with_callback_path(mut self, path: impl Into<String>) -> Self {
        self.callback_path = path.into();
        self
    }

    /// Override the post-logout redirect path.
    #[must_use]
    pub fn with_logout_path(mut self, path: impl Into<String>) -> Self {
        self.logout_path = path.into();
        self
    }

    /// Identity provider base URL.
    #[must_use]
    pub fn issuer(&self) -> &Url {
        &self.issuer
    }

    /// OAuth client identifier of this application.
    #[must_use]
    pub fn client_app_id(&self) -> &str {
        &self.client_app_id
    }

    /// Default callback redirect URI (origin + callback path).
    pub(crate) fn callback_uri(&self) -> Result<Url, AuthError> {
        self.origin.join(&self.callback_path).map_err(Into::into)
    }

    /// Default post-logout redirect URI (origin + logout path).
    pub(crate) fn logout_uri(&self) -> Result<Url, AuthError> {
        self.origin.join(&self.logout_path).map_err(Into::into)
    }
}
