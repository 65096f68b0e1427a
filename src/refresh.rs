//! Expiry-aware, per-level token refresh engine.
//!
//! Policy, per level:
//! - Half-life: an unforced pass refreshes only once a token has used more
//!   than half of its granted lifetime.
//! - Rotation: a successful refresh moves the prior token into the cached
//!   pool, where it may still serve other audiences at the same level.
//! - Loop prevention: when a refresh no longer extends expiry, the new entry
//!   is marked `expire_soon` and never refreshed again.
//! - Expiry enforcement: an unrefreshed token within the expiry slack is
//!   deleted from the store.
//!
//! All entry points run inside the caller's cross-instance lock scope; the
//! engine itself works on an in-memory [`SessionSnapshot`] that the caller
//! loads and writes back while holding the lock.

use futures::future::join_all;
use tracing::{debug, warn};

use crate::discovery::DiscoveryCache;
use crate::error::AuthError;
use crate::http::TokenEndpointClient;
use crate::store::{
    clear_entry, derive_level, entry, set_entry, SessionSnapshot, EXPIRY_SLACK_MS,
};
use crate::types::{decode_claims, ClientToken};

/// Collaborators a refresh pass needs, borrowed from the session facade.
pub(crate) struct RefreshContext<'a> {
    pub discovery: &'a DiscoveryCache,
    pub endpoint: &'a TokenEndpointClient,
}

/// Outcome of refreshing one level, applied to the snapshot by the caller.
#[derive(Debug)]
pub(crate) enum LevelOutcome {
    /// Nothing to do (half-life not reached, or token still healthy).
    Unchanged,
    /// The entry is dead: within the expiry slack and not refreshed.
    Evict,
    /// Refresh failed; the entry stays but loses its refresh token so the
    /// failure is not retried.
    RefreshTokenLost,
    /// Refresh succeeded; the prior entry moves into the cached pool.
    Replaced(ClientToken),
}

/// Decide and perform the refresh for a single level.
///
/// Infallible by design: refresh failures degrade to token eviction or
/// refresh-token loss and are logged, never propagated.
pub(crate) async fn refresh_level(
    ctx: &RefreshContext<'_>,
    current: &ClientToken,
    level: i64,
    target_app_id: &str,
    force: bool,
    now_ms: i64,
) -> LevelOutcome {
    let remaining = current.remaining_ms(now_ms);
    let lifetime = current.lifetime_ms();
    if !force && remaining > lifetime / 2 {
        return LevelOutcome::Unchanged;
    }
    debug!(level, target = target_app_id, remaining, "refreshing token");

    let mut refresh_token_lost = false;
    if let Some(refresh_token) = current.refresh_token.as_deref().filter(|_| !current.expire_soon) {
        match attempt_refresh(ctx, refresh_token, target_app_id).await {
            Ok(mut next) => {
                // A rotation that stopped extending expiry would otherwise
                // retrigger on every access.
                if now_ms - current.decoded.iat * 1000 >= EXPIRY_SLACK_MS
                    && next.decoded.exp <= current.decoded.exp
                {
                    debug!(level, "refresh no longer extends expiry; marking expire_soon");
                    next.expire_soon = true;
                }
                if next.decoded.level != level {
                    warn!(
                        level,
                        token_level = next.decoded.level,
                        "refreshed token reports a different security level"
                    );
                }
                debug!(level, target = target_app_id, "token refreshed");
                return LevelOutcome::Replaced(next);
            }
            Err(err) => {
                warn!(level, error = %err, "token refresh failed");
                refresh_token_lost = true;
            }
        }
    }

    // Token not refreshed; enforce expiry on the original.
    if remaining < EXPIRY_SLACK_MS {
        debug!(level, remaining, "token dropped");
        return LevelOutcome::Evict;
    }
    if refresh_token_lost {
        LevelOutcome::RefreshTokenLost
    } else {
        LevelOutcome::Unchanged
    }
}

async fn attempt_refresh(
    ctx: &RefreshContext<'_>,
    refresh_token: &str,
    target_app_id: &str,
) -> Result<ClientToken, AuthError> {
    let openid = ctx.discovery.load().await?;
    let response = ctx.endpoint.refresh(&openid.token_endpoint, refresh_token, target_app_id).await?;
    let decoded = decode_claims(&response.access_token)?;
    Ok(ClientToken {
        token: response.access_token,
        refresh_token: response.refresh_token,
        decoded,
        expire_soon: false,
    })
}

/// Fold one level's outcome back into the snapshot.
pub(crate) fn apply_outcome(state: &mut SessionSnapshot, level: i64, outcome: LevelOutcome) {
    match outcome {
        LevelOutcome::Unchanged => {}
        LevelOutcome::Evict => clear_entry(&mut state.tokens, level),
        LevelOutcome::RefreshTokenLost => {
            if let Ok(index) = usize::try_from(level) {
                if let Some(Some(token)) = state.tokens.get_mut(index) {
                    token.refresh_token = None;
                }
            }
        }
        LevelOutcome::Replaced(next) => {
            if let Some(previous) = entry(&state.tokens, level).cloned() {
                state.pool.push(previous);
            }
            set_entry(&mut state.tokens, level, next);
        }
    }
}

/// Refresh a single level in place, without re-deriving the security level.
pub(crate) async fn refresh_one(
    ctx: &RefreshContext<'_>,
    state: &mut SessionSnapshot,
    level: i64,
    target_app_id: &str,
    force: bool,
    now_ms: i64,
) {
    let Some(current) = entry(&state.tokens, level).cloned() else { return };
    let outcome = refresh_level(ctx, &current, level, target_app_id, force, now_ms).await;
    apply_outcome(state, level, outcome);
}

/// Refresh every level up to the current security level concurrently against
/// one shared `now` snapshot, then re-derive the level.
pub(crate) async fn refresh_all(ctx: &RefreshContext<'_>, state: &mut SessionSnapshot, now_ms: i64) {
    if state.level == -1 {
        return;
    }
    let target_app_id =
        state.effective().map(|t| t.decoded.client_id.clone()).unwrap_or_default();

    let passes = (0..=state.level).filter_map(|level| {
        let current = entry(&state.tokens, level).cloned()?;
        let target = target_app_id.clone();
        Some(async move {
            (level, refresh_level(ctx, &current, level, &target, false, now_ms).await)
        })
    });
    let outcomes = join_all(passes).await;

    for (level, outcome) in outcomes {
        apply_outcome(state, level, outcome);
    }
    state.level = derive_level(&state.tokens, now_ms);
    debug!(level = state.level, "security level recomputed");
}
