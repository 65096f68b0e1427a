//! End-to-end session flows against a mock identity provider.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stacked_auth::{
    AuthConfig, ClientToken, LocalLock, LogoutOptions, MemoryStore, SessionManager,
    StartLoginOptions, StateStore, TokenClaims,
};

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs() as i64)
}

fn claims(aud: &str, level: i64, iat: i64, exp: i64) -> TokenClaims {
    TokenClaims {
        iss: "https://id.example.com".into(),
        sub: "user-1".into(),
        aud: aud.into(),
        client_id: "client-app".into(),
        sid: "sess-1".into(),
        jti: format!("jti-{aud}-{level}"),
        perm: vec![format!("uperm://{aud}/**")],
        level,
        exp,
        iat,
    }
}

fn forge_token(claims: &TokenClaims) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    format!("{header}.{payload}.sig")
}

fn discovery_body(base: &str) -> serde_json::Value {
    serde_json::json!({
        "issuer": base,
        "authorization_endpoint": format!("{base}/authorize"),
        "token_endpoint": format!("{base}/token"),
        "userinfo_endpoint": format!("{base}/userinfo"),
        "end_session_endpoint": format!("{base}/logout"),
        "jwks_uri": format!("{base}/jwks"),
        "response_types_supported": ["code"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["ES256"],
    })
}

async fn mount_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(discovery_body(&server.uri())))
        .mount(server)
        .await;
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn manager_for(server: &MockServer, store: Arc<MemoryStore>) -> SessionManager {
    init_tracing();
    let config = AuthConfig::new(
        server.uri().parse().unwrap(),
        "client-app",
        "server-app",
        "issuer-app",
        "https://app.example.com".parse().unwrap(),
    );
    SessionManager::new(config, store, Arc::new(LocalLock::new()))
}

async fn seed_tokens(store: &MemoryStore, tokens: &[Option<ClientToken>], level: i64) {
    store.put("tokens", serde_json::to_string(tokens).unwrap()).await.unwrap();
    store.put("level", level.to_string()).await.unwrap();
}

fn live_token(aud: &str, level: i64, refresh: Option<&str>) -> ClientToken {
    let now = now_secs();
    let decoded = claims(aud, level, now - 10, now + 3600);
    ClientToken {
        token: forge_token(&decoded),
        refresh_token: refresh.map(str::to_string),
        decoded,
        expire_soon: false,
    }
}

#[tokio::test]
async fn full_login_flow_installs_the_token() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;

    let now = now_secs();
    let access = forge_token(&claims("client-app", 2, now, now + 3600));
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=code-1"))
        .and(body_string_contains("client_id=client-app"))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": access,
            "refresh_token": "rt-1",
            "id_token": "idt-1",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let manager = manager_for(&server, store.clone());

    let url = manager.start_login("/home", StartLoginOptions::default()).await.unwrap();
    let state = url
        .query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
        .unwrap();

    let redirect = manager.finish_login("code-1", &state).await.unwrap();
    assert_eq!(redirect, "/home");

    assert_eq!(manager.security_level().await.unwrap(), 2);
    assert!(manager.is_logged_in().await.unwrap());
    assert_eq!(manager.user_id().await.unwrap().as_deref(), Some("user-1"));
    assert_eq!(store.get("id_token").await.unwrap().unwrap(), "\"idt-1\"");

    let token = manager.get_auth_token(None).await.unwrap().unwrap();
    assert_eq!(token.token, access);
    assert_eq!(token.refresh_token.as_deref(), Some("rt-1"));
}

#[tokio::test]
async fn activation_failure_leaves_the_session_logged_out() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;

    let now = now_secs();
    let access = forge_token(&claims("client-app", 0, now, now + 3600));
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": access,
            "id_token": "idt-1",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let manager = manager_for(&server, store.clone());
    let url = manager.start_login("/home", StartLoginOptions::default()).await.unwrap();
    let state = url
        .query_pairs()
        .find(|(key, _)| key == "state")
        .map(|(_, value)| value.into_owned())
        .unwrap();

    let err = manager
        .finish_login_with("code-1", &state, |_token| async {
            Err(stacked_auth::AuthError::Storage("session claim rejected".into()))
        })
        .await
        .unwrap_err();
    assert!(matches!(err, stacked_auth::AuthError::Storage(_)));

    // The exchange happened but the token was never committed.
    assert!(!manager.is_logged_in().await.unwrap());
    assert!(store.get("tokens").await.unwrap().is_none());
}

#[tokio::test]
async fn logout_wipes_the_store_and_describes_the_end_session_post() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;

    let store = Arc::new(MemoryStore::new());
    seed_tokens(&store, &[Some(live_token("client-app", 0, Some("rt-0")))], 0).await;
    store.put("cached_tokens", serde_json::to_string(&[live_token("server-app", 0, None)]).unwrap())
        .await
        .unwrap();
    store.put("id_token", "\"idt-1\"".into()).await.unwrap();

    let manager = manager_for(&server, store.clone());
    let request = manager.logout(LogoutOptions::default()).await.unwrap();

    assert_eq!(request.url, format!("{}/logout", server.uri()));
    assert_eq!(request.id_token_hint, "idt-1");
    assert_eq!(request.client_id, "client-app");
    assert_eq!(request.post_logout_redirect_uri, "https://app.example.com/auth/logout");

    assert!(!manager.is_logged_in().await.unwrap());
    assert_eq!(store.get("tokens").await.unwrap().unwrap(), "[]");
    assert_eq!(store.get("cached_tokens").await.unwrap().unwrap(), "[]");
    assert_eq!(store.get("level").await.unwrap().unwrap(), "-1");
    assert_eq!(store.get("id_token").await.unwrap().unwrap(), "\"\"");
}

#[tokio::test]
async fn retargeting_exchanges_the_token_and_pools_the_old_one() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;

    let now = now_secs();
    let retargeted = forge_token(&claims("server-app", 0, now, now + 7200));
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .and(body_string_contains("refresh_token=rt-0"))
        .and(body_string_contains("target_app_id=server-app"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": retargeted,
            "refresh_token": "rt-1",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let original = live_token("client-app", 0, Some("rt-0"));
    seed_tokens(&store, &[Some(original.clone())], 0).await;

    let manager = manager_for(&server, store.clone());
    let token = manager.get_auth_token(Some("server-app")).await.unwrap().unwrap();
    assert_eq!(token.decoded.aud, "server-app");
    assert_eq!(token.refresh_token.as_deref(), Some("rt-1"));

    // The superseded client-app token remains usable from the pool.
    let pool: Vec<ClientToken> =
        serde_json::from_str(&store.get("cached_tokens").await.unwrap().unwrap()).unwrap();
    assert_eq!(pool.len(), 1);
    assert_eq!(pool[0].token, original.token);
}

#[tokio::test]
async fn cached_pool_serves_other_audiences_without_network() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let cached = live_token("server-app", 0, None);
    seed_tokens(&store, &[Some(live_token("client-app", 0, Some("rt-0")))], 0).await;
    store.put("cached_tokens", serde_json::to_string(&[cached.clone()]).unwrap()).await.unwrap();

    let manager = manager_for(&server, store);
    let token = manager.get_auth_token(Some("server-app")).await.unwrap().unwrap();
    assert_eq!(token.token, cached.token);
}

#[tokio::test]
async fn rapid_accesses_coalesce_into_one_background_refresh() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;

    // Seeded and replacement tokens both sit past their half-life, so every
    // refresh pass that actually runs makes exactly one endpoint call. Two
    // are expected: the initial pass, then one coalesced background pass for
    // all five accesses.
    let now = now_secs();
    let replacement = forge_token(&claims("client-app", 0, now - 100, now + 50));
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": replacement,
            "refresh_token": "rt-1",
        })))
        .expect(2)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let seeded_claims = claims("client-app", 0, now - 100, now + 10);
    let seeded = ClientToken {
        token: forge_token(&seeded_claims),
        refresh_token: Some("rt-0".into()),
        decoded: seeded_claims,
        expire_soon: false,
    };
    seed_tokens(&store, &[Some(seeded)], 0).await;

    let manager = manager_for(&server, store);
    for _ in 0..5 {
        assert!(manager.get_auth_token(None).await.unwrap().is_some());
    }

    // Wait out the coalescing window plus the pass itself.
    tokio::time::sleep(std::time::Duration::from_millis(1600)).await;
    let refresh_calls = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|request| request.url.path() == "/token")
        .count();
    assert_eq!(refresh_calls, 2);
}

#[tokio::test]
async fn expired_session_is_evicted_on_first_access() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;

    let store = Arc::new(MemoryStore::new());
    let now = now_secs();
    let dead_claims = claims("client-app", 0, now - 3600, now - 60);
    let dead = ClientToken {
        token: forge_token(&dead_claims),
        refresh_token: None,
        decoded: dead_claims,
        expire_soon: false,
    };
    seed_tokens(&store, &[Some(dead)], 0).await;

    let manager = manager_for(&server, store.clone());
    assert!(manager.get_auth_token(None).await.unwrap().is_none());
    assert!(!manager.is_logged_in().await.unwrap());
    assert_eq!(store.get("level").await.unwrap().unwrap(), "-1");
}
