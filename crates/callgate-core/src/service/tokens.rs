use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::SessionTokenMode;
use crate::error::{GatewayError, Result};
use crate::util::Clock;

/// Number of random bytes in a session token (hex-encoded to 64 chars).
pub const TOKEN_BYTES: usize = 32;

/// Upper bound on the token lifetime (about ten years).
const MAX_TTL_SECS: u64 = 10 * 365 * 86_400;

/// Generate a fresh session token from the OS CSPRNG.
pub fn mint_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Session tokens handed out by the handshake and required on every
/// gated call.
///
/// In `Presence` mode any non-empty token is accepted, which matches
/// clients that cache a token across gateway restarts. In `Bound` mode the
/// token must have been issued by this process and not have expired.
pub struct SessionTokens {
    mode: SessionTokenMode,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    issued: DashMap<String, DateTime<Utc>>,
}

impl SessionTokens {
    pub fn new(mode: SessionTokenMode, ttl_secs: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            mode,
            ttl: Duration::seconds(ttl_secs.min(MAX_TTL_SECS) as i64),
            clock,
            issued: DashMap::new(),
        }
    }

    /// Mint and record a new token.
    pub fn issue(&self) -> String {
        let token = mint_token();
        if self.mode == SessionTokenMode::Bound {
            let now = self.clock.now();
            self.issued.retain(|_, expires| *expires > now);
            self.issued.insert(token.clone(), now + self.ttl);
            debug!("Issued session token ({} live)", self.issued.len());
        }
        token
    }

    /// Accept or refuse the token presented with a gated call.
    pub fn check(&self, token: Option<&str>) -> Result<()> {
        let token = match token.map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return Err(GatewayError::ClientUnauthorized),
        };

        match self.mode {
            SessionTokenMode::Presence => Ok(()),
            SessionTokenMode::Bound => {
                let now = self.clock.now();
                let live = self
                    .issued
                    .get(token)
                    .map(|expires| *expires > now)
                    .unwrap_or(false);
                if live {
                    Ok(())
                } else {
                    if self.issued.remove(token).is_some() {
                        info!("Session token expired");
                    }
                    Err(GatewayError::ClientUnauthorized)
                }
            }
        }
    }
}
