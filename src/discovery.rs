//! OIDC discovery document cache.

use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::error::AuthError;
use crate::store::Persisted;
use crate::types::OpenIdConfig;

/// Fetches and persistently caches the provider's discovery document.
///
/// The document is assumed static for the process lifetime: once cached there
/// is no TTL and no revalidation. Concurrent first loads within one instance
/// share a single fetch; redundant fetches across instances are tolerated.
pub(crate) struct DiscoveryCache {
    issuer: Url,
    http: reqwest::Client,
    persisted: Persisted,
    // Single fetch slot: concurrent callers wait here, then re-read the cache.
    inflight: Mutex<()>,
}

impl DiscoveryCache {
    pub(crate) fn new(issuer: Url, http: reqwest::Client, persisted: Persisted) -> Self {
        Self { issuer, http, persisted, inflight: Mutex::new(()) }
    }

    /// Return the discovery document, fetching it at most once.
    ///
    /// # Errors
    /// [`AuthError::Network`] if the fetch fails, returns non-2xx, or the
    /// body is not a parseable document. Failures are not cached; the next
    /// call retries.
    pub(crate) async fn load(&self) -> Result<OpenIdConfig, AuthError> {
        if let Some(config) = self.persisted.openid_config().await? {
            return Ok(config);
        }

        let _fetching = self.inflight.lock().await;
        // The fetch we waited on may have filled the cache.
        if let Some(config) = self.persisted.openid_config().await? {
            return Ok(config);
        }

        let discovery_url = self.issuer.join(".well-known/openid-configuration")?;
        debug!(url = %discovery_url, "fetching discovery document");
        let config: OpenIdConfig = self
            .http
            .get(discovery_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.persisted.save_openid_config(&config).await?;
        Ok(config)
    }
}
