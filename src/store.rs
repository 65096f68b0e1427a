//! Token store: persisted session state and its derivation rules.
//!
//! The store is a sparse sequence indexed by security level, with the
//! invariant that `tokens[i].decoded.level == i` whenever an entry is
//! present. The effective security level and the cached-pool pruning are
//! *derived* here and recomputed only inside the refresh engine's lock
//! scope; nothing else writes to the store.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::AuthError;
use crate::pkce::LoginState;
use crate::storage::StateStore;
use crate::types::{ClientToken, OpenIdConfig};

/// Tokens within this many milliseconds of expiry are treated as dead.
pub(crate) const EXPIRY_SLACK_MS: i64 = 3_000;

/// Sparse, level-indexed token sequence.
pub(crate) type TokenVec = Vec<Option<ClientToken>>;

pub(crate) fn entry(tokens: &TokenVec, level: i64) -> Option<&ClientToken> {
    let index = usize::try_from(level).ok()?;
    tokens.get(index).and_then(Option::as_ref)
}

pub(crate) fn set_entry(tokens: &mut TokenVec, level: i64, token: ClientToken) {
    let Ok(index) = usize::try_from(level) else { return };
    if tokens.len() <= index {
        tokens.resize(index + 1, None);
    }
    tokens[index] = Some(token);
}

pub(crate) fn clear_entry(tokens: &mut TokenVec, level: i64) {
    if let Ok(index) = usize::try_from(level) {
        if let Some(slot) = tokens.get_mut(index) {
            *slot = None;
        }
    }
}

/// Highest index holding a present, unexpired entry, else -1.
pub(crate) fn derive_level(tokens: &TokenVec, now_ms: i64) -> i64 {
    tokens
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.as_ref().is_some_and(|t| t.is_live(now_ms)))
        .map(|(i, _)| i as i64)
        .max()
        .unwrap_or(-1)
}

/// Drop pool entries within [`EXPIRY_SLACK_MS`] of expiry.
pub(crate) fn prune_pool(pool: &mut Vec<ClientToken>, now_ms: i64) {
    pool.retain(|token| {
        let remaining = token.remaining_ms(now_ms);
        if remaining < EXPIRY_SLACK_MS {
            debug!(remaining, "cached token dropped");
            return false;
        }
        true
    });
}

/// The lock-protected slice of persisted state, loaded once per critical
/// section, mutated in memory, and written back before the lock is released.
#[derive(Debug, Clone)]
pub(crate) struct SessionSnapshot {
    pub tokens: TokenVec,
    pub pool: Vec<ClientToken>,
    pub level: i64,
}

impl SessionSnapshot {
    pub(crate) fn effective(&self) -> Option<&ClientToken> {
        entry(&self.tokens, self.level)
    }
}

// Persisted keys. All values are JSON-serialized.
const KEY_OPENID_CONFIG: &str = "openid_config";
const KEY_ID_TOKEN: &str = "id_token";
const KEY_TOKENS: &str = "tokens";
const KEY_CACHED_TOKENS: &str = "cached_tokens";
const KEY_LEVEL: &str = "level";
const KEY_LOGIN_STATE: &str = "login_state";

/// Typed access to the persisted session shapes.
#[derive(Clone)]
pub(crate) struct Persisted {
    store: Arc<dyn StateStore>,
}

impl Persisted {
    pub(crate) fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    async fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, AuthError> {
        match self.store.get(key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| AuthError::Storage(format!("corrupt value at {key}: {e}"))),
            None => Ok(None),
        }
    }

    async fn save_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), AuthError> {
        let raw = serde_json::to_string(value)
            .map_err(|e| AuthError::Storage(format!("unserializable value for {key}: {e}")))?;
        self.store.put(key, raw).await
    }

    pub(crate) async fn openid_config(&self) -> Result<Option<OpenIdConfig>, AuthError> {
        self.load_json(KEY_OPENID_CONFIG).await
    }

    pub(crate) async fn save_openid_config(&self, config: &OpenIdConfig) -> Result<(), AuthError> {
        self.save_json(KEY_OPENID_CONFIG, config).await
    }

    pub(crate) async fn id_token(&self) -> Result<Option<String>, AuthError> {
        self.load_json(KEY_ID_TOKEN).await
    }

    pub(crate) async fn save_id_token(&self, id_token: &str) -> Result<(), AuthError> {
        self.save_json(KEY_ID_TOKEN, &id_token).await
    }

    pub(crate) async fn tokens(&self) -> Result<TokenVec, AuthError> {
        Ok(self.load_json(KEY_TOKENS).await?.unwrap_or_default())
    }

    pub(crate) async fn save_tokens(&self, tokens: &[Option<ClientToken>]) -> Result<(), AuthError> {
        self.save_json(KEY_TOKENS, &tokens).await
    }

    pub(crate) async fn pool(&self) -> Result<Vec<ClientToken>, AuthError> {
        Ok(self.load_json(KEY_CACHED_TOKENS).await?.unwrap_or_default())
    }

    pub(crate) async fn save_pool(&self, pool: &[ClientToken]) -> Result<(), AuthError> {
        self.save_json(KEY_CACHED_TOKENS, &pool).await
    }

    pub(crate) async fn level(&self) -> Result<i64, AuthError> {
        Ok(self.load_json(KEY_LEVEL).await?.unwrap_or(-1))
    }

    pub(crate) async fn save_level(&self, level: i64) -> Result<(), AuthError> {
        self.save_json(KEY_LEVEL, &level).await
    }

    pub(crate) async fn login_state(&self) -> Result<Option<LoginState>, AuthError> {
        self.load_json(KEY_LOGIN_STATE).await
    }

    pub(crate) async fn save_login_state(&self, state: &LoginState) -> Result<(), AuthError> {
        self.save_json(KEY_LOGIN_STATE, state).await
    }

    pub(crate) async fn load_snapshot(&self) -> Result<SessionSnapshot, AuthError> {
        Ok(SessionSnapshot {
            tokens: self.tokens().await?,
            pool: self.pool().await?,
            level: self.level().await?,
        })
    }

    pub(crate) async fn save_snapshot(&self, snapshot: &SessionSnapshot) -> Result<(), AuthError> {
        self.save_tokens(&snapshot.tokens).await?;
        self.save_pool(&snapshot.pool).await?;
        self.save_level(snapshot.level).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::TokenClaims;

    fn token(level: i64, exp: i64) -> ClientToken {
        ClientToken {
            token: format!("token-{level}"),
            refresh_token: None,
            decoded: TokenClaims {
                iss: "iss".into(),
                sub: "sub".into(),
                aud: "aud".into(),
                client_id: "client".into(),
                sid: "sid".into(),
                jti: format!("jti-{level}"),
                perm: vec![],
                level,
                exp,
                iat: 0,
            },
            expire_soon: false,
        }
    }

    #[test]
    fn sparse_entries() {
        let mut tokens = TokenVec::new();
        set_entry(&mut tokens, 2, token(2, 100));
        assert_eq!(tokens.len(), 3);
        assert!(entry(&tokens, 0).is_none());
        assert!(entry(&tokens, 1).is_none());
        assert_eq!(entry(&tokens, 2).unwrap().decoded.level, 2);

        clear_entry(&mut tokens, 2);
        assert!(entry(&tokens, 2).is_none());
        assert!(entry(&tokens, -1).is_none());
    }

    #[test]
    fn derive_level_skips_expired_and_absent() {
        let mut tokens = TokenVec::new();
        assert_eq!(derive_level(&tokens, 0), -1);

        set_entry(&mut tokens, 0, token(0, 100));
        set_entry(&mut tokens, 2, token(2, 100));
        assert_eq!(derive_level(&tokens, 50_000), 2);

        // Level 2 expired at 100s; level 0 alone remains... also expired.
        assert_eq!(derive_level(&tokens, 100_000), -1);

        set_entry(&mut tokens, 1, token(1, 200));
        assert_eq!(derive_level(&tokens, 100_000), 1);
    }

    #[test]
    fn prune_drops_near_expiry_entries() {
        let mut pool = vec![token(0, 10), token(0, 13), token(0, 100)];
        // now = 10s: first expired, second within 3s slack, third keeps.
        prune_pool(&mut pool, 10_000);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].decoded.exp, 100);
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let persisted = Persisted::new(Arc::new(MemoryStore::new()));
        let loaded = persisted.load_snapshot().await.unwrap();
        assert_eq!(loaded.level, -1);
        assert!(loaded.tokens.is_empty());

        let mut snapshot = loaded;
        set_entry(&mut snapshot.tokens, 1, token(1, 100));
        snapshot.pool.push(token(0, 100));
        snapshot.level = 1;
        persisted.save_snapshot(&snapshot).await.unwrap();

        let reloaded = persisted.load_snapshot().await.unwrap();
        assert_eq!(reloaded.level, 1);
        assert_eq!(reloaded.pool.len(), 1);
        assert_eq!(reloaded.effective().unwrap().decoded.level, 1);
    }

    #[tokio::test]
    async fn corrupt_value_is_a_storage_error() {
        let store = Arc::new(MemoryStore::new());
        store.put("level", "not json".into()).await.unwrap();
        let persisted = Persisted::new(store);
        assert!(matches!(persisted.level().await, Err(AuthError::Storage(_))));
    }
}
