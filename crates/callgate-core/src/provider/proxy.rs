use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::service::gate::Authorization;
use crate::types::{LlmProxyRequest, TtsProxyRequest};

use super::llm::LlmCall;
use super::tts::TtsCall;
use super::{ByteStream, Upstream};

/// Relays authorized calls to the vendors and settles their quota.
///
/// The reservation held by an [`Authorization`] is committed only after the
/// vendor has answered with a success status. Any earlier failure drops it,
/// so the principal is not charged.
pub struct UpstreamProxy {
    config: Arc<Config>,
    upstream: Arc<dyn Upstream>,
}

impl UpstreamProxy {
    pub fn new(config: Arc<Config>, upstream: Arc<dyn Upstream>) -> Self {
        Self { config, upstream }
    }

    /// Open the vendor stream and hand it back for relaying.
    ///
    /// If the charge fails at commit time the stream is dropped unread,
    /// which closes the vendor connection.
    pub async fn forward_llm(&self, auth: Authorization, request: &LlmProxyRequest) -> Result<ByteStream> {
        let call = LlmCall::build(request, &self.config.providers)?;

        let stream = match self.upstream.open_stream(&call.target, &call.body).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("LLM request to {} failed: {}", call.vendor, e);
                return Err(GatewayError::UpstreamUnavailable {
                    provider: call.vendor.to_string(),
                });
            }
        };

        let used = auth.reservation.commit().await?;
        info!("Relaying {} stream (usage {:?})", call.vendor, used);
        Ok(stream)
    }

    /// Synthesize speech and return the vendor's JSON unchanged.
    pub async fn forward_tts(&self, auth: Authorization, request: &TtsProxyRequest) -> Result<serde_json::Value> {
        let call = TtsCall::build(request, &self.config.tts)?;

        let response = match self.upstream.post_json(&call.target, &call.body).await {
            Ok(response) => response,
            Err(e) => {
                warn!("TTS request with voice {} failed: {}", call.voice_id, e);
                return Err(GatewayError::UpstreamUnavailable {
                    provider: "minimax".to_string(),
                });
            }
        };

        let used = auth.reservation.commit().await?;
        info!("TTS synthesized with voice {} (usage {:?})", call.voice_id, used);
        Ok(response)
    }
}
