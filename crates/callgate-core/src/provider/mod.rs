pub mod llm;
pub mod proxy;
pub mod tts;
pub mod upstream;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

use crate::error::{GatewayError, UpstreamError};

pub use proxy::UpstreamProxy;
pub use upstream::HttpUpstream;

/// Body of a streaming upstream response, chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// Chat-completion vendors the gateway can relay to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmVendor {
    DeepSeek,
    SiliconFlow,
    Gemini,
}

impl LlmVendor {
    pub const ALL: [LlmVendor; 3] = [LlmVendor::DeepSeek, LlmVendor::SiliconFlow, LlmVendor::Gemini];

    /// Identifier used by clients in `serviceProvider`.
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmVendor::DeepSeek => "deepseek",
            LlmVendor::SiliconFlow => "siliconflow",
            LlmVendor::Gemini => "gemini",
        }
    }

    /// Environment variable holding the vendor credential.
    pub fn env_key(&self) -> &'static str {
        match self {
            LlmVendor::DeepSeek => "DEEPSEEK_API_KEY",
            LlmVendor::SiliconFlow => "SILICONFLOW_API_KEY",
            LlmVendor::Gemini => "GEMINI_API_KEY",
        }
    }

    /// Chat-completions endpoint used when the config does not override it.
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            LlmVendor::DeepSeek => "https://api.deepseek.com/chat/completions",
            LlmVendor::SiliconFlow => "https://api.siliconflow.cn/v1/chat/completions",
            // OpenAI-compatible relay in front of Gemini.
            LlmVendor::Gemini => "https://api.ssopen.top/v1/chat/completions",
        }
    }
}

impl std::fmt::Display for LlmVendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LlmVendor {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LlmVendor::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| GatewayError::UnsupportedProvider(s.to_string()))
    }
}

/// Where and with which credential a request is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub url: String,
    pub api_key: String,
}

/// Transport to third-party vendors. Implemented over HTTP by
/// [`HttpUpstream`]; tests substitute their own.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// POST `body` and return the response body as a stream once a success
    /// status has been received.
    async fn open_stream(&self, target: &UpstreamTarget, body: &serde_json::Value) -> Result<ByteStream, UpstreamError>;

    /// POST `body` and return the parsed JSON response.
    async fn post_json(&self, target: &UpstreamTarget, body: &serde_json::Value)
        -> Result<serde_json::Value, UpstreamError>;
}
