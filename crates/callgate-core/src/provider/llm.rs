use serde_json::json;
use tracing::debug;

use crate::config::ProvidersConfig;
use crate::error::{GatewayError, Result};
use crate::types::LlmProxyRequest;

use super::{LlmVendor, UpstreamTarget};

/// Sampling temperature sent with every relayed chat request.
pub const TEMPERATURE: f64 = 1.2;

/// A validated chat-completion request ready to be sent upstream.
#[derive(Debug, Clone)]
pub struct LlmCall {
    pub vendor: LlmVendor,
    pub target: UpstreamTarget,
    pub body: serde_json::Value,
}

impl LlmCall {
    /// Validate the client payload and resolve the vendor endpoint and
    /// credential. Streaming is always forced on.
    pub fn build(request: &LlmProxyRequest, providers: &ProvidersConfig) -> Result<Self> {
        let provider = request.service_provider.as_deref().filter(|s| !s.is_empty());
        let model = request.model_name.as_deref().filter(|s| !s.is_empty());
        let messages = request.messages.as_ref().filter(|m| !m.is_empty());

        let (provider, model, messages) = match (provider, model, messages) {
            (Some(p), Some(m), Some(msgs)) => (p, m, msgs),
            _ => {
                return Err(GatewayError::InvalidRequest(
                    "serviceProvider, modelName and messages are required".to_string(),
                ))
            }
        };

        let vendor: LlmVendor = provider.parse()?;
        let config = providers.get(vendor);
        if config.api_key.is_empty() {
            return Err(GatewayError::misconfigured(vendor.env_key()));
        }
        let url = config
            .api_base
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| vendor.default_endpoint().to_string());

        let body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "temperature": TEMPERATURE,
        });
        debug!("Built {} request for model {} ({} messages)", vendor, model, messages.len());

        Ok(Self {
            vendor,
            target: UpstreamTarget {
                url,
                api_key: config.api_key.clone(),
            },
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    fn providers() -> ProvidersConfig {
        let mut providers = ProvidersConfig::default();
        providers.deepseek.api_key = "sk-ds".to_string();
        providers.gemini.api_key = "sk-gm".to_string();
        providers.gemini.api_base = Some("http://localhost:9000/v1/chat/completions".to_string());
        providers
    }

    fn request(provider: &str) -> LlmProxyRequest {
        LlmProxyRequest {
            service_provider: Some(provider.to_string()),
            model_name: Some("deepseek-chat".to_string()),
            messages: Some(vec![ChatMessage {
                role: "user".to_string(),
                content: json!("hi"),
            }]),
        }
    }

    #[test]
    fn test_body_forces_streaming() {
        let call = LlmCall::build(&request("deepseek"), &providers()).unwrap();
        assert_eq!(call.vendor, LlmVendor::DeepSeek);
        assert_eq!(call.target.url, "https://api.deepseek.com/chat/completions");
        assert_eq!(call.target.api_key, "sk-ds");
        assert_eq!(call.body["stream"], json!(true));
        assert_eq!(call.body["temperature"], json!(1.2));
        assert_eq!(call.body["model"], json!("deepseek-chat"));
        assert_eq!(call.body["messages"][0]["content"], json!("hi"));
    }

    #[test]
    fn test_endpoint_override() {
        let call = LlmCall::build(&request("gemini"), &providers()).unwrap();
        assert_eq!(call.target.url, "http://localhost:9000/v1/chat/completions");
    }

    #[test]
    fn test_missing_fields() {
        let mut req = request("deepseek");
        req.messages = Some(Vec::new());
        assert!(matches!(
            LlmCall::build(&req, &providers()),
            Err(GatewayError::InvalidRequest(_))
        ));

        let mut req = request("deepseek");
        req.model_name = None;
        assert!(matches!(
            LlmCall::build(&req, &providers()),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_unknown_vendor_and_missing_key() {
        assert!(matches!(
            LlmCall::build(&request("openai"), &providers()),
            Err(GatewayError::UnsupportedProvider(_))
        ));

        let err = LlmCall::build(&request("siliconflow"), &providers()).unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(matches!(err, GatewayError::ServerMisconfigured { ref key } if key == "SILICONFLOW_API_KEY"));
    }
}
