#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

use callgate_core::config::Config;
use callgate_core::provider::{HttpUpstream, Upstream};
use callgate_core::service::handshake;
use callgate_core::service::http::{create_router, AppState};
use callgate_core::store::{MemoryStore, RecordStore};
use callgate_core::types::{Capability, Principal, RolePermission, VersionConfig};
use callgate_core::util::ManualClock;

pub const ROOT_KEY: &str = "integration-root-key";
pub const SESSION: &str = "lc-session-u1";

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 9, 30, 0).unwrap()
}

pub fn config() -> Config {
    let mut config = Config::default();
    config.handshake.root_key = ROOT_KEY.to_string();
    config
}

/// Store with an active "1.0" build and principal `u1` (session
/// [`SESSION`]) that has `llm_used` calls on record for today.
pub fn seeded_store(llm_limit: i64, llm_used: u64) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.put_version(VersionConfig {
        version_name: "1.0".into(),
        status: "active".into(),
        update_message: String::new(),
        update_url: String::new(),
    });

    let mut principal = Principal::new("u1");
    principal.llm_call_count = llm_used;
    principal.last_call_date = Some(now().date_naive());
    store.put_principal(principal);
    store.bind_session(SESSION, "u1");
    store.add_role_member("User", "u1");
    store.put_permission(
        RolePermission::new("User")
            .with_limit(Capability::Llm, llm_limit)
            .with_limit(Capability::Tts, 10),
    );
    store
}

pub fn router_with(config: Config, store: Arc<dyn RecordStore>, upstream: Arc<dyn Upstream>) -> Router {
    let clock = Arc::new(ManualClock::new(now()));
    let state = AppState::new(config, store, upstream, clock).unwrap();
    create_router(Arc::new(state))
}

pub fn router(config: Config, store: Arc<dyn RecordStore>) -> Router {
    let timeout = config.gateway.upstream_timeout_secs;
    router_with(config, store, Arc::new(HttpUpstream::new(timeout)))
}

pub fn signed_handshake(version: &str) -> Value {
    let timestamp = now().timestamp().to_string();
    let signature = handshake::sign(ROOT_KEY.as_bytes(), version, &timestamp).unwrap();
    serde_json::json!({
        "version": version,
        "timestamp": timestamp,
        "signature": signature,
    })
}

/// POST a JSON body with extra headers and return status plus raw body.
pub async fn post_raw(router: &Router, path: &str, headers: &[(&str, &str)], body: Value) -> (StatusCode, Vec<u8>, Option<String>) {
    let mut request = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let response = router
        .clone()
        .oneshot(request.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec(), content_type)
}

pub async fn post(router: &Router, path: &str, headers: &[(&str, &str)], body: Value) -> (StatusCode, Value) {
    let (status, bytes, _) = post_raw(router, path, headers, body).await;
    (status, serde_json::from_slice(&bytes).unwrap())
}

/// Handshake as build "1.0" and return the session token.
pub async fn handshake_token(router: &Router) -> String {
    let (status, body) = post(router, "/1.1/functions/handshake", &[], signed_handshake("1.0")).await;
    assert_eq!(status, StatusCode::OK);
    body["result"]["sessionAuthToken"].as_str().unwrap().to_string()
}
