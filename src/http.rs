//! HTTP client for the provider's token endpoint.
//!
//! Two grants are spoken: `refresh_token` (with the provider-specific
//! `target_app_id` retargeting parameter) and `authorization_code` with a
//! PKCE verifier. Non-success responses carry the body text as detail.

use crate::error::AuthError;
use crate::types::TokenResponse;

pub(crate) struct TokenEndpointClient {
    http: reqwest::Client,
    client_app_id: String,
}

impl TokenEndpointClient {
    pub(crate) fn new(http: reqwest::Client, client_app_id: String) -> Self {
        Self { http, client_app_id }
    }

    /// `grant_type=refresh_token`, retargeted at `target_app_id`.
    ///
    /// # Errors
    /// [`AuthError::Network`] on transport failure, [`AuthError::RefreshFailed`]
    /// on a non-success status.
    pub(crate) async fn refresh(
        &self,
        token_endpoint: &str,
        refresh_token: &str,
        target_app_id: &str,
    ) -> Result<TokenResponse, AuthError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_app_id.as_str()),
            ("target_app_id", target_app_id),
        ];
        let response = self.http.post(token_endpoint).form(&params).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = response.text().await.unwrap_or_default();
            return Err(AuthError::RefreshFailed { status, detail });
        }
        response.json().await.map_err(Into::into)
    }

    /// `grant_type=authorization_code` with the stored PKCE verifier.
    ///
    /// # Errors
    /// [`AuthError::Network`] on transport failure,
    /// [`AuthError::TokenExchangeFailed`] on a non-success status.
    pub(crate) async fn exchange(
        &self,
        token_endpoint: &str,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, AuthError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.client_app_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("code_verifier", code_verifier),
        ];
        let response = self.http.post(token_endpoint).form(&params).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let detail = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenExchangeFailed { status, detail });
        }
        response.json().await.map_err(Into::into)
    }
}
