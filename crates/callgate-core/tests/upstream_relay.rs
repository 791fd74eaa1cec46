//! Relay tests against a mock vendor.

mod common;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use callgate_core::error::UpstreamError;
use callgate_core::provider::{ByteStream, HttpUpstream, Upstream, UpstreamTarget};
use callgate_core::service::http::{PRINCIPAL_SESSION_HEADER, SESSION_AUTH_HEADER};

use common::*;

const LLM: &str = "/1.1/functions/proxyLlmRequest";
const TTS: &str = "/1.1/functions/proxyTtsRequest";
const HEADERS: [(&str, &str); 2] = [(SESSION_AUTH_HEADER, "tok"), (PRINCIPAL_SESSION_HEADER, SESSION)];
const SSE: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";

fn llm_body() -> serde_json::Value {
    json!({
        "serviceProvider": "deepseek",
        "modelName": "deepseek-chat",
        "messages": [{"role": "user", "content": "hello"}],
    })
}

fn config_for(server: &MockServer) -> callgate_core::config::Config {
    let mut config = config();
    config.providers.deepseek.api_key = "sk-test".to_string();
    config.providers.deepseek.api_base = Some(format!("{}/chat/completions", server.uri()));
    config.tts.api_key = "mm-test".to_string();
    config.tts.group_id = "g1".to_string();
    config.tts.api_base = server.uri();
    config
}

#[tokio::test]
async fn test_llm_stream_relayed_byte_for_byte() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(header("accept", "text/event-stream"))
        .and(body_partial_json(json!({"model": "deepseek-chat", "stream": true, "temperature": 1.2})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SSE, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let store = seeded_store(5, 0);
    let router = router(config_for(&server), store.clone());

    let (status, bytes, content_type) = post_raw(&router, LLM, &HEADERS, llm_body()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/octet-stream"));
    assert_eq!(bytes, SSE.as_bytes());
    assert_eq!(store.snapshot("u1").unwrap().llm_call_count, 1);
}

#[tokio::test]
async fn test_client_cannot_disable_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SSE, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let router = router(config_for(&server), seeded_store(5, 0));
    let mut body = llm_body();
    body["stream"] = json!(false);
    let (status, _, _) = post_raw(&router, LLM, &HEADERS, body).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_vendor_error_is_bad_gateway_and_not_charged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .mount(&server)
        .await;

    let store = seeded_store(5, 0);
    let router = router(config_for(&server), store.clone());

    let (status, body) = post(&router, LLM, &HEADERS, llm_body()).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], 502);
    assert!(!body["error"].as_str().unwrap().contains("exploded"));
    assert_eq!(store.snapshot("u1").unwrap().llm_call_count, 0);
}

#[tokio::test]
async fn test_slow_vendor_times_out_without_charge() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let store = seeded_store(5, 0);
    let router = router_with(config_for(&server), store.clone(), Arc::new(HttpUpstream::new(1)));

    let (status, _) = post(&router, LLM, &HEADERS, llm_body()).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(store.snapshot("u1").unwrap().llm_call_count, 0);
}

#[tokio::test]
async fn test_exhausted_quota_never_reaches_vendor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(SSE, "text/event-stream"))
        .expect(0)
        .mount(&server)
        .await;

    let router = router(config_for(&server), seeded_store(5, 5));
    let (status, body) = post(&router, LLM, &HEADERS, llm_body()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains('5'));
}

#[tokio::test]
async fn test_unsupported_provider() {
    let server = MockServer::start().await;
    let router = router(config_for(&server), seeded_store(5, 0));
    let mut body = llm_body();
    body["serviceProvider"] = json!("openai");
    let (status, _) = post(&router, LLM, &HEADERS, body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_tts_json_relayed_and_charged() {
    let server = MockServer::start().await;
    let vendor_reply = json!({
        "data": {"audio": "fffb90c4", "status": 2},
        "base_resp": {"status_code": 0, "status_msg": "success"},
    });
    Mock::given(method("POST"))
        .and(path("/v1/t2a_v2"))
        .and(query_param("GroupId", "g1"))
        .and(header("authorization", "Bearer mm-test"))
        .and(body_partial_json(json!({
            "model": "speech-02-hd",
            "text": "good morning",
            "voice_setting": {"voice_id": "female-yujie", "speed": 1.1, "vol": 1.2, "pitch": -1},
            "audio_setting": {"sample_rate": 24000, "bitrate": 128000, "format": "mp3"},
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(vendor_reply.clone()))
        .expect(1)
        .mount(&server)
        .await;

    let store = seeded_store(5, 0);
    let router = router(config_for(&server), store.clone());
    let body = json!({"voiceType": "system", "text": "good morning", "emotion": "angry"});

    let (status, body) = post(&router, TTS, &HEADERS, body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], vendor_reply);
    assert_eq!(store.snapshot("u1").unwrap().tts_call_count, 1);
}

#[tokio::test]
async fn test_custom_voice_uses_client_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("authorization", "Bearer client-key"))
        .and(body_partial_json(json!({"voice_setting": {"voice_id": "my-clone"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"audio": "00"}})))
        .expect(1)
        .mount(&server)
        .await;

    let router = router(config_for(&server), seeded_store(5, 0));
    let body = json!({
        "voiceType": "custom",
        "customApiKey": "client-key",
        "customVoiceId": "my-clone",
        "text": "hi",
    });
    let (status, _) = post(&router, TTS, &HEADERS, body).await;
    assert_eq!(status, StatusCode::OK);
}

/// Sets its flag when the stream holding it is dropped.
struct ClosedFlag(Arc<AtomicBool>);

impl Drop for ClosedFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Sends one chunk and then keeps the stream open until it is dropped.
struct OpenEndedUpstream {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Upstream for OpenEndedUpstream {
    async fn open_stream(&self, _: &UpstreamTarget, _: &serde_json::Value) -> Result<ByteStream, UpstreamError> {
        let flag = ClosedFlag(self.closed.clone());
        let stream = futures::stream::iter(vec![Ok::<_, UpstreamError>(Bytes::from_static(b"data: first\n\n"))])
            .chain(futures::stream::pending())
            .map(move |chunk| {
                let _held = &flag;
                chunk
            });
        Ok(stream.boxed())
    }

    async fn post_json(&self, _: &UpstreamTarget, _: &serde_json::Value) -> Result<serde_json::Value, UpstreamError> {
        Err(UpstreamError::Timeout(0))
    }
}

#[tokio::test]
async fn test_client_disconnect_closes_vendor_stream() {
    let closed = Arc::new(AtomicBool::new(false));
    let upstream = Arc::new(OpenEndedUpstream { closed: closed.clone() });
    let mut config = config();
    config.providers.deepseek.api_key = "sk-test".to_string();
    let store = seeded_store(5, 0);
    let router = router_with(config, store.clone(), upstream);

    let mut request = Request::builder()
        .method("POST")
        .uri(LLM)
        .header("content-type", "application/json");
    for (name, value) in HEADERS {
        request = request.header(name, value);
    }
    let response = router
        .oneshot(request.body(Body::from(llm_body().to_string())).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert_eq!(&first[..], b"data: first\n\n");
    assert!(!closed.load(Ordering::SeqCst));

    drop(body);
    assert!(closed.load(Ordering::SeqCst));
    // Streaming had started, so the call stays charged.
    assert_eq!(store.snapshot("u1").unwrap().llm_call_count, 1);
}
