use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{self, header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::provider::{HttpUpstream, Upstream, UpstreamProxy};
use crate::service::gate::{AccessGate, RequestContext};
use crate::service::handshake::HandshakeVerifier;
use crate::service::quota::QuotaLedger;
use crate::service::tokens::SessionTokens;
use crate::store::RecordStore;
use crate::types::{Capability, HandshakeRequest, LlmProxyRequest, PermissionRequest, TtsProxyRequest};
use crate::util::{Clock, SystemClock};

/// Header carrying the token returned by the handshake.
pub const SESSION_AUTH_HEADER: &str = "x-session-auth-token";
/// Header identifying the logged-in principal.
pub const PRINCIPAL_SESSION_HEADER: &str = "x-lc-session";

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state for the HTTP API.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn RecordStore>,
    pub verifier: HandshakeVerifier,
    pub gate: AccessGate,
    pub proxy: UpstreamProxy,
}

impl AppState {
    /// Wire every component from one config, store, transport and clock.
    pub fn new(
        config: Config,
        store: Arc<dyn RecordStore>,
        upstream: Arc<dyn Upstream>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let tokens = Arc::new(SessionTokens::new(
            config.gateway.session_tokens,
            config.gateway.session_token_ttl_secs,
            clock.clone(),
        ));
        let verifier = HandshakeVerifier::new(&config.handshake, store.clone(), tokens.clone(), clock.clone())?;
        let ledger = QuotaLedger::new(store.clone(), clock);
        let gate = AccessGate::new(store.clone(), tokens, ledger, config.gateway.default_history_limit);
        let proxy = UpstreamProxy::new(config.clone(), upstream);

        Ok(Self {
            config,
            store,
            verifier,
            gate,
            proxy,
        })
    }

    /// Production wiring: HTTP transport and the wall clock.
    pub fn from_config(config: Config, store: Arc<dyn RecordStore>) -> Result<Self> {
        let upstream = Arc::new(HttpUpstream::new(config.gateway.upstream_timeout_secs));
        Self::new(config, store, upstream, Arc::new(SystemClock))
    }

    /// Build the per-request context from the identity headers.
    async fn request_context(&self, headers: &HeaderMap) -> Result<RequestContext> {
        let session_token = header_value(headers, SESSION_AUTH_HEADER);
        let principal = match header_value(headers, PRINCIPAL_SESSION_HEADER) {
            Some(session) => self.store.principal_by_session(&session).await?,
            None => None,
        };
        Ok(RequestContext::new(self.store.clone(), session_token, principal))
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Decode a JSON body. An empty body reads as an empty object so missing
/// fields are reported by the handler.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| GatewayError::InvalidRequest(format!("malformed JSON body: {}", e)))
}

/// Cloud-function success envelope.
fn result<T: Serialize>(value: T) -> Json<serde_json::Value> {
    Json(json!({ "result": value }))
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("Request failed ({}): {}", status.as_u16(), self);
        } else {
            debug!("Request refused ({}): {}", status.as_u16(), self);
        }
        let body = json!({
            "code": status.as_u16(),
            "error": self.client_message(),
        });
        (status, Json(body)).into_response()
    }
}

/// Create the axum router with all routes.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/1.1/functions/handshake", post(handle_handshake))
        .route("/1.1/functions/requestApiCallPermission", post(handle_permission))
        .route("/1.1/functions/proxyLlmRequest", post(handle_proxy_llm))
        .route("/1.1/functions/proxyTtsRequest", post(handle_proxy_tts))
        .route("/1.1/functions/hello", post(handle_hello))
        .route("/health", get(handle_health))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::AUTHORIZATION,
                    HeaderName::from_static(SESSION_AUTH_HEADER),
                    HeaderName::from_static(PRINCIPAL_SESSION_HEADER),
                ]),
        )
        .with_state(state)
}

/// POST /1.1/functions/handshake
async fn handle_handshake(State(state): State<Arc<AppState>>, body: Bytes) -> Result<impl IntoResponse> {
    let request: HandshakeRequest = parse_body(&body)?;
    let response = state.verifier.verify(&request).await?;
    Ok(result(response))
}

/// POST /1.1/functions/requestApiCallPermission
async fn handle_permission(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let request: PermissionRequest = parse_body(&body)?;
    let ctx = state.request_context(&headers).await?;
    let capability: Capability = request
        .usage_type
        .as_deref()
        .ok_or_else(|| GatewayError::InvalidRequest("usageType is required".to_string()))?
        .parse()
        .map_err(GatewayError::InvalidRequest)?;

    let response = state.gate.request_permission(&ctx, capability).await?;
    Ok(result(response))
}

/// POST /1.1/functions/proxyLlmRequest: raw vendor stream.
async fn handle_proxy_llm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let request: LlmProxyRequest = parse_body(&body)?;
    let ctx = state.request_context(&headers).await?;
    let auth = state.gate.authorize(&ctx, Capability::Llm).await?;
    let stream = state.proxy.forward_llm(auth, &request).await?;

    // A client disconnect drops the body, which closes the vendor stream.
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response())
}

/// POST /1.1/functions/proxyTtsRequest
async fn handle_proxy_tts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let request: TtsProxyRequest = parse_body(&body)?;
    let ctx = state.request_context(&headers).await?;
    let auth = state.gate.authorize(&ctx, Capability::Tts).await?;
    let response = state.proxy.forward_tts(auth, &request).await?;
    Ok(result(response))
}

/// POST /1.1/functions/hello
async fn handle_hello() -> impl IntoResponse {
    result("Hello world!")
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// GET /health
async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: format!("{} ({})", crate::VERSION, crate::GIT_HASH),
    })
}

/// Start the HTTP server on the given address.
pub async fn serve(addr: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let router = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
