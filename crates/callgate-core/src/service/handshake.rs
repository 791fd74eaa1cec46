use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::HandshakeConfig;
use crate::error::{GatewayError, Result};
use crate::service::tokens::SessionTokens;
use crate::store::RecordStore;
use crate::types::{HandshakeRequest, HandshakeResponse};
use crate::util::Clock;

type HmacSha256 = Hmac<Sha256>;

/// Status reported for versions without a policy record.
pub const BLOCKED_STATUS: &str = "blocked";
pub const UNSUPPORTED_VERSION_MESSAGE: &str = "Your app version is not supported, please update.";

/// Hex HMAC-SHA256 of `"{version}|{timestamp}"` under `root_key`.
pub fn sign(root_key: &[u8], version: &str, timestamp: &str) -> Result<String> {
    let mac = challenge_mac(root_key, version, timestamp)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn challenge_mac(root_key: &[u8], version: &str, timestamp: &str) -> Result<HmacSha256> {
    let Ok(mut mac) = HmacSha256::new_from_slice(root_key) else {
        return Err(GatewayError::misconfigured("CLIENT_ROOT_KEY"));
    };
    mac.update(format!("{}|{}", version, timestamp).as_bytes());
    Ok(mac)
}

/// Timestamp as the client sent it. Numbers are signed in their decimal
/// form; strings must be all digits (an optional leading minus aside).
fn timestamp_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

fn parse_timestamp(text: &str) -> Result<i64> {
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(GatewayError::InvalidRequest("timestamp must be an integer".to_string()));
    }
    text.parse::<i64>()
        .map_err(|_| GatewayError::InvalidRequest("timestamp out of range".to_string()))
}

/// Authenticates client builds and hands out session tokens.
pub struct HandshakeVerifier {
    root_key: Vec<u8>,
    freshness_window_secs: i64,
    store: Arc<dyn RecordStore>,
    tokens: Arc<SessionTokens>,
    clock: Arc<dyn Clock>,
}

impl HandshakeVerifier {
    pub fn new(
        config: &HandshakeConfig,
        store: Arc<dyn RecordStore>,
        tokens: Arc<SessionTokens>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.root_key.is_empty() {
            return Err(GatewayError::misconfigured("CLIENT_ROOT_KEY"));
        }
        Ok(Self {
            root_key: config.root_key.as_bytes().to_vec(),
            freshness_window_secs: config.freshness_window_secs,
            store,
            tokens,
            clock,
        })
    }

    /// Check freshness and signature, then report the version policy.
    ///
    /// A token is minted only when the version's status is `active`.
    pub async fn verify(&self, request: &HandshakeRequest) -> Result<HandshakeResponse> {
        let version = request.version.as_deref().filter(|v| !v.is_empty());
        let timestamp = request.timestamp.as_ref().and_then(timestamp_text);
        let signature = request.signature.as_deref().filter(|s| !s.is_empty());

        let (version, timestamp, signature) = match (version, timestamp, signature) {
            (Some(v), Some(t), Some(s)) => (v, t, s),
            _ => {
                return Err(GatewayError::InvalidRequest(
                    "handshake requires version, timestamp and signature".to_string(),
                ))
            }
        };

        let client_ts = parse_timestamp(&timestamp)?;
        let skew = self.clock.unix_seconds().saturating_sub(client_ts).saturating_abs();
        if skew > self.freshness_window_secs {
            warn!("Handshake for version {} rejected: clock skew {}s", version, skew);
            return Err(GatewayError::RequestExpired);
        }

        self.verify_signature(version, &timestamp, signature)?;

        let (active, status, update_message, update_url) = match self.store.version_config(version).await? {
            Some(config) => (
                config.is_active(),
                config.status,
                config.update_message,
                config.update_url,
            ),
            None => (
                false,
                BLOCKED_STATUS.to_string(),
                UNSUPPORTED_VERSION_MESSAGE.to_string(),
                String::new(),
            ),
        };

        let session_auth_token = active.then(|| self.tokens.issue());
        info!(
            "Handshake for version {}: status {}{}",
            version,
            status,
            if session_auth_token.is_some() { ", token issued" } else { "" }
        );

        Ok(HandshakeResponse {
            status,
            update_message,
            update_url,
            session_auth_token,
        })
    }

    /// The signature is compared as bytes, so hex case does not matter.
    fn verify_signature(&self, version: &str, timestamp: &str, signature: &str) -> Result<()> {
        let Ok(provided) = hex::decode(signature) else {
            warn!("Handshake for version {}: signature is not hex", version);
            return Err(GatewayError::SignatureInvalid);
        };
        let mac = challenge_mac(&self.root_key, version, timestamp)?;
        // Constant-time comparison.
        mac.verify_slice(&provided).map_err(|_| {
            warn!("Handshake for version {}: signature mismatch", version);
            GatewayError::SignatureInvalid
        })
    }
}
