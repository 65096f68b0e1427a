//! Session facade: login, logout, and token access.
//!
//! A [`SessionManager`] owns the persisted session for one configured
//! provider and exposes the public contract: [`get_auth_token`],
//! [`start_login`], [`finish_login`], [`logout`], plus derived accessors for
//! the current user and security level. Any number of clones (and any number
//! of independent instances sharing the same [`StateStore`]) may operate on
//! the session concurrently; every store mutation runs under the shared
//! cross-instance lock.
//!
//! [`get_auth_token`]: SessionManager::get_auth_token
//! [`start_login`]: SessionManager::start_login
//! [`finish_login`]: SessionManager::finish_login
//! [`logout`]: SessionManager::logout

use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::config::AuthConfig;
use crate::discovery::DiscoveryCache;
use crate::error::AuthError;
use crate::http::TokenEndpointClient;
use crate::pkce::{generate_code_challenge, generate_code_verifier, generate_state, LoginState};
use crate::refresh::{refresh_all, refresh_one, RefreshContext};
use crate::storage::{SessionLock, StateStore};
use crate::store::{entry, prune_pool, set_entry, Persisted, EXPIRY_SLACK_MS};
use crate::types::{decode_claims, ClientToken, OpenIdConfig};

/// Name of the cross-instance lock serializing all store mutations.
const LOCK_NAME: &str = "tokens";

/// Coalescing window for the opportunistic background refresh.
const DEBOUNCE_MS: u64 = 1_000;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}

/// A permission scope request: a path template plus whether the grant is
/// optional.
///
/// Paths may reference `{{client}}`, `{{server}}` and `{{issuer}}`, which are
/// substituted with the configured application identifiers.
#[derive(Debug, Clone)]
pub struct Permission {
    pub path: String,
    pub optional: bool,
}

impl Permission {
    /// A required permission for `path`.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), optional: false }
    }

    /// An optional permission for `path`.
    #[must_use]
    pub fn optional(path: impl Into<String>) -> Self {
        Self { path: path.into(), optional: true }
    }
}

/// Options for [`SessionManager::start_login`].
#[derive(Debug, Clone, Default)]
pub struct StartLoginOptions {
    /// Permission scopes to request. Defaults to full access on the resource
    /// server plus a session-claim scope on the issuer.
    pub permissions: Option<Vec<Permission>>,
    /// Extra query parameters appended to the authorization URL.
    pub additional_params: Vec<(String, String)>,
    /// Redirect URI override; defaults to the configured callback URI.
    pub callback: Option<String>,
}

/// Options for [`SessionManager::logout`].
#[derive(Debug, Clone, Default)]
pub struct LogoutOptions {
    /// Post-logout redirect override; defaults to the configured logout URI.
    pub callback: Option<String>,
}

/// The end-session form POST the caller must perform to complete a logout.
///
/// Local session state is already cleared by the time this is returned; the
/// host submits these fields to `url` as `application/x-www-form-urlencoded`
/// to terminate the provider-side session.
#[derive(Debug, Clone)]
pub struct LogoutRequest {
    pub url: String,
    pub id_token_hint: String,
    pub client_id: String,
    pub post_logout_redirect_uri: String,
}

struct Inner {
    config: AuthConfig,
    persisted: Persisted,
    lock: Arc<dyn SessionLock>,
    discovery: DiscoveryCache,
    endpoint: TokenEndpointClient,
    init: tokio::sync::OnceCell<()>,
    debounce: OnceLock<mpsc::UnboundedSender<()>>,
}

/// Stacked-session manager for one configured identity provider.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager over the given persisted store and cross-instance
    /// lock.
    ///
    /// Construction performs no I/O; the first token access runs an initial
    /// refresh pass over whatever session the store already holds.
    #[must_use]
    pub fn new(config: AuthConfig, store: Arc<dyn StateStore>, lock: Arc<dyn SessionLock>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let persisted = Persisted::new(store);
        let discovery = DiscoveryCache::new(config.issuer.clone(), http.clone(), persisted.clone());
        let endpoint = TokenEndpointClient::new(http, config.client_app_id.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                persisted,
                lock,
                discovery,
                endpoint,
                init: tokio::sync::OnceCell::new(),
                debounce: OnceLock::new(),
            }),
        }
    }

    /// Load the provider's discovery document (cached after the first fetch).
    ///
    /// # Errors
    /// [`AuthError::Network`] if the document cannot be fetched or parsed.
    pub async fn load_openid_config(&self) -> Result<OpenIdConfig, AuthError> {
        self.inner.discovery.load().await
    }

    /// Return a token for `app_id`, refreshing or retargeting as needed.
    ///
    /// With `app_id = None` the effective token's own client id is used. The
    /// result is `None` when logged out, or when a forced retargeting
    /// exchange failed and dropped the entry.
    ///
    /// # Errors
    /// Storage and lock failures propagate; refresh failures do not (the
    /// affected entry degrades per the refresh policy instead).
    pub async fn get_auth_token(
        &self,
        app_id: Option<&str>,
    ) -> Result<Option<ClientToken>, AuthError> {
        self.ensure_initialized().await;

        let now = now_ms();
        let effective = self.effective_token().await?;
        if effective.as_ref().map_or(0, |t| t.decoded.exp * 1000) - now < EXPIRY_SLACK_MS {
            debug!("effective token near expiry, running refresh pass");
            self.locked_refresh_all().await?;
        }
        self.schedule_background_refresh();

        let snapshot = self.inner.persisted.load_snapshot().await?;
        let Some(effective) = snapshot.effective().cloned() else {
            return Ok(None);
        };
        let app_id = app_id.map_or_else(|| effective.decoded.client_id.clone(), str::to_string);
        if effective.decoded.aud == app_id {
            return Ok(Some(effective));
        }

        let pool = self.locked_pruned_pool().await?;
        if let Some(cached) = pool
            .into_iter()
            .find(|token| token.decoded.aud == app_id && token.decoded.level == snapshot.level)
        {
            return Ok(Some(cached));
        }

        debug!(target = %app_id, "retargeting current token");
        self.locked_refresh_one(snapshot.level, &app_id, true).await?;
        let tokens = self.inner.persisted.tokens().await?;
        Ok(entry(&tokens, snapshot.level).cloned())
    }

    /// Begin an authorization-code login and return the URL to navigate to.
    ///
    /// `redirect` is an application-level target stored for the caller and
    /// handed back by [`finish_login`](Self::finish_login); it is not sent to
    /// the provider. Any in-flight login is silently superseded.
    ///
    /// # Errors
    /// [`AuthError::Network`] if discovery fails, [`AuthError::InvalidUrl`]
    /// if the authorization endpoint does not parse, [`AuthError::Storage`]
    /// if the login state cannot be persisted.
    pub async fn start_login(
        &self,
        redirect: impl Into<String>,
        options: StartLoginOptions,
    ) -> Result<Url, AuthError> {
        let config = &self.inner.config;
        let permissions = options.permissions.unwrap_or_else(|| {
            vec![Permission::new("{{server}}/**"), Permission::new("{{issuer}}/session/claim")]
        });
        let scopes: Vec<String> =
            permissions.iter().map(|p| self.permission_scope(p)).collect();
        debug!(scopes = ?scopes, "mapped permission scopes");

        let openid = self.inner.discovery.load().await?;
        let mut url: Url = openid.authorization_endpoint.parse()?;
        let scope = ["openid", "profile", "email"]
            .into_iter()
            .map(str::to_string)
            .chain(scopes)
            .map(|s| urlencoding::encode(&s).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let callback = match options.callback {
            Some(callback) => callback,
            None => config.callback_uri()?.to_string(),
        };

        let code_verifier = generate_code_verifier();
        let code_challenge = generate_code_challenge(&code_verifier);
        let state = generate_state();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &config.client_app_id);
            query.append_pair("scope", &scope);
            query.append_pair("response_type", "code");
            query.append_pair("confidential", "0");
            query.append_pair("redirect_uri", &callback);
            for (key, value) in &options.additional_params {
                query.append_pair(key, value);
            }
            query.append_pair("code_challenge", &code_challenge);
            query.append_pair("code_challenge_method", "S256");
            query.append_pair("state", &state);
        }

        let login_state = LoginState { code_verifier, state, redirect: redirect.into() };
        self.inner.persisted.save_login_state(&login_state).await?;
        debug!(url = %url, "login started");
        Ok(url)
    }

    /// Complete a login from the authorization callback and return the
    /// redirect target recorded by [`start_login`](Self::start_login).
    ///
    /// # Errors
    /// [`AuthError::MissingLoginState`] with no flow in progress,
    /// [`AuthError::StateMismatch`] if `state` does not match (checked before
    /// any network call), [`AuthError::TokenExchangeFailed`] if the provider
    /// rejects the code.
    pub async fn finish_login(&self, code: &str, state: &str) -> Result<String, AuthError> {
        self.finish_login_with(code, state, |_token| async { Ok(()) }).await
    }

    /// [`finish_login`](Self::finish_login) with an activation hook invoked
    /// after the exchange but before the token is committed to the store.
    ///
    /// The hook receives the raw access token; an error aborts the login
    /// without installing the token.
    pub async fn finish_login_with<F, Fut>(
        &self,
        code: &str,
        state: &str,
        activate: F,
    ) -> Result<String, AuthError>
    where
        F: FnOnce(String) -> Fut + Send,
        Fut: Future<Output = Result<(), AuthError>> + Send,
    {
        let login_state =
            self.inner.persisted.login_state().await?.ok_or(AuthError::MissingLoginState)?;
        if state != login_state.state {
            return Err(AuthError::StateMismatch {
                expected: login_state.state,
                received: state.to_string(),
            });
        }

        let openid = self.inner.discovery.load().await?;
        let callback = self.inner.config.callback_uri()?;
        let response = self
            .inner
            .endpoint
            .exchange(&openid.token_endpoint, code, callback.as_str(), &login_state.code_verifier)
            .await?;

        self.inner
            .persisted
            .save_id_token(response.id_token.as_deref().unwrap_or_default())
            .await?;
        activate(response.access_token.clone()).await?;
        self.apply_token(response.access_token, response.refresh_token).await?;
        debug!("login finished");
        Ok(login_state.redirect)
    }

    /// Clear the local session and describe the end-session POST.
    ///
    /// The store is wiped under the lock before this returns; the provider
    /// session survives until the caller submits the returned form.
    ///
    /// # Errors
    /// [`AuthError::Network`] if discovery fails (the local session is not
    /// yet cleared in that case).
    pub async fn logout(&self, options: LogoutOptions) -> Result<LogoutRequest, AuthError> {
        let id_token = self.inner.persisted.id_token().await?.unwrap_or_default();
        let openid = self.inner.discovery.load().await?;
        let callback = match options.callback {
            Some(callback) => callback,
            None => self.inner.config.logout_uri()?.to_string(),
        };

        let _guard = self.inner.lock.acquire(LOCK_NAME).await?;
        debug!("logging out");
        self.inner.persisted.save_tokens(&[]).await?;
        self.inner.persisted.save_pool(&[]).await?;
        self.inner.persisted.save_level(-1).await?;
        self.inner.persisted.save_id_token("").await?;

        Ok(LogoutRequest {
            url: openid.end_session_endpoint,
            id_token_hint: id_token,
            client_id: self.inner.config.client_app_id.clone(),
            post_logout_redirect_uri: callback,
        })
    }

    /// The token at the current security level, if any.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub async fn effective_token(&self) -> Result<Option<ClientToken>, AuthError> {
        let snapshot = self.inner.persisted.load_snapshot().await?;
        Ok(snapshot.effective().cloned())
    }

    /// Current security level; -1 when logged out.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub async fn security_level(&self) -> Result<i64, AuthError> {
        self.inner.persisted.level().await
    }

    /// Client id of the effective token, if logged in.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub async fn app_id(&self) -> Result<Option<String>, AuthError> {
        Ok(self.effective_token().await?.map(|t| t.decoded.client_id))
    }

    /// Subject of the effective token, if logged in.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub async fn user_id(&self) -> Result<Option<String>, AuthError> {
        Ok(self.effective_token().await?.map(|t| t.decoded.sub))
    }

    /// Whether any security level is live.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub async fn is_logged_in(&self) -> Result<bool, AuthError> {
        Ok(self.security_level().await? > -1)
    }

    fn permission_scope(&self, permission: &Permission) -> String {
        let config = &self.inner.config;
        let scheme = if permission.optional { "uperm+optional" } else { "uperm" };
        let path = permission
            .path
            .replace("{{client}}", &config.client_app_id)
            .replace("{{server}}", &config.server_app_id)
            .replace("{{issuer}}", &config.issuer_app_id);
        format!("{scheme}://{path}")
    }

    /// Run the initial refresh pass exactly once per instance. Failures are
    /// logged; an unreachable provider must not poison every later call.
    async fn ensure_initialized(&self) {
        self.inner
            .init
            .get_or_init(|| async {
                if let Err(err) = self.locked_refresh_all().await {
                    warn!(error = %err, "initial refresh pass failed");
                }
            })
            .await;
    }

    fn refresh_context(&self) -> RefreshContext<'_> {
        RefreshContext { discovery: &self.inner.discovery, endpoint: &self.inner.endpoint }
    }

    async fn locked_refresh_all(&self) -> Result<(), AuthError> {
        let _guard = self.inner.lock.acquire(LOCK_NAME).await?;
        let mut snapshot = self.inner.persisted.load_snapshot().await?;
        refresh_all(&self.refresh_context(), &mut snapshot, now_ms()).await;
        self.inner.persisted.save_snapshot(&snapshot).await
    }

    async fn locked_refresh_one(
        &self,
        level: i64,
        target_app_id: &str,
        force: bool,
    ) -> Result<(), AuthError> {
        let _guard = self.inner.lock.acquire(LOCK_NAME).await?;
        let mut snapshot = self.inner.persisted.load_snapshot().await?;
        refresh_one(&self.refresh_context(), &mut snapshot, level, target_app_id, force, now_ms())
            .await;
        self.inner.persisted.save_snapshot(&snapshot).await
    }

    /// Prune the cached pool under the lock and return the survivors.
    async fn locked_pruned_pool(&self) -> Result<Vec<ClientToken>, AuthError> {
        let _guard = self.inner.lock.acquire(LOCK_NAME).await?;
        let mut pool = self.inner.persisted.pool().await?;
        prune_pool(&mut pool, now_ms());
        self.inner.persisted.save_pool(&pool).await?;
        Ok(pool)
    }

    /// Install a freshly exchanged token at its claimed level.
    async fn apply_token(
        &self,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<(), AuthError> {
        let decoded = decode_claims(&access_token)?;
        let level = decoded.level;
        let token = ClientToken { token: access_token, refresh_token, decoded, expire_soon: false };

        let _guard = self.inner.lock.acquire(LOCK_NAME).await?;
        let mut tokens = self.inner.persisted.tokens().await?;
        set_entry(&mut tokens, level, token);
        self.inner.persisted.save_tokens(&tokens).await?;
        self.inner.persisted.save_level(level).await?;
        debug!(level, "token applied");
        Ok(())
    }

    /// Queue a debounced background refresh pass. Events arriving within the
    /// coalescing window collapse into a single pass; failures are logged.
    fn schedule_background_refresh(&self) {
        let sender = self.inner.debounce.get_or_init(|| {
            let (sender, mut receiver) = mpsc::unbounded_channel();
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            tokio::spawn(async move {
                while receiver.recv().await.is_some() {
                    tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS)).await;
                    while receiver.try_recv().is_ok() {}
                    let Some(inner) = weak.upgrade() else { break };
                    let manager = SessionManager { inner };
                    if let Err(err) = manager.locked_refresh_all().await {
                        warn!(error = %err, "background refresh pass failed");
                    }
                }
            });
            sender
        });
        // Send fails only when the worker exited, which means we are shutting
        // down anyway.
        let _ = sender.send(());
    }
}
