use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Role that bypasses every quota.
pub const ADMIN_ROLE: &str = "Admin";
/// Role every principal holds, whether or not a membership row exists.
pub const USER_ROLE: &str = "User";
/// Sentinel for "no limit" in limits and history sizes.
pub const UNLIMITED: i64 = -1;

/// A gated operation kind with its own daily counter and limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Llm,
    Tts,
}

impl Capability {
    pub const ALL: [Capability; 2] = [Capability::Llm, Capability::Tts];

    /// Human readable name used in quota messages.
    pub fn label(&self) -> &'static str {
        match self {
            Capability::Llm => "language model",
            Capability::Tts => "voice",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Llm => write!(f, "llm"),
            Capability::Tts => write!(f, "tts"),
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm" => Ok(Capability::Llm),
            "tts" => Ok(Capability::Tts),
            _ => Err(format!("Unknown usage type: {s}")),
        }
    }
}

/// A registered device/user subject to role and quota checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub llm_call_count: u64,
    #[serde(default)]
    pub tts_call_count: u64,
    #[serde(default)]
    pub last_call_date: Option<NaiveDate>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            llm_call_count: 0,
            tts_call_count: 0,
            last_call_date: None,
        }
    }

    pub fn usage(&self, capability: Capability) -> u64 {
        match capability {
            Capability::Llm => self.llm_call_count,
            Capability::Tts => self.tts_call_count,
        }
    }

    pub fn usage_mut(&mut self, capability: Capability) -> &mut u64 {
        match capability {
            Capability::Llm => &mut self.llm_call_count,
            Capability::Tts => &mut self.tts_call_count,
        }
    }
}

/// Per-role policy record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolePermission {
    pub role_name: String,
    #[serde(default)]
    pub llm_limit: Option<i64>,
    #[serde(default)]
    pub tts_limit: Option<i64>,
    /// Display quota for client-side conversation truncation.
    #[serde(default)]
    pub history_limit: Option<i64>,
}

impl RolePermission {
    pub fn new(role_name: impl Into<String>) -> Self {
        Self {
            role_name: role_name.into(),
            llm_limit: None,
            tts_limit: None,
            history_limit: None,
        }
    }

    pub fn limit(&self, capability: Capability) -> Option<i64> {
        match capability {
            Capability::Llm => self.llm_limit,
            Capability::Tts => self.tts_limit,
        }
    }

    pub fn with_limit(mut self, capability: Capability, limit: i64) -> Self {
        match capability {
            Capability::Llm => self.llm_limit = Some(limit),
            Capability::Tts => self.tts_limit = Some(limit),
        }
        self
    }

    pub fn with_history_limit(mut self, limit: i64) -> Self {
        self.history_limit = Some(limit);
        self
    }
}

/// Policy for one client app version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionConfig {
    pub version_name: String,
    /// `active`, `blocked`, or any operator-defined status.
    pub status: String,
    #[serde(default)]
    pub update_message: String,
    #[serde(default)]
    pub update_url: String,
}

impl VersionConfig {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// One chat turn relayed to the LLM vendor. `content` is forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandshakeRequest {
    pub version: Option<String>,
    /// Seconds since epoch, sent as a string or a number.
    pub timestamp: Option<serde_json::Value>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    pub status: String,
    pub update_message: String,
    pub update_url: String,
    pub session_auth_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionRequest {
    pub usage_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionResponse {
    pub can_call: bool,
    pub message: String,
    pub history_limit: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmProxyRequest {
    pub service_provider: Option<String>,
    pub model_name: Option<String>,
    pub messages: Option<Vec<ChatMessage>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TtsProxyRequest {
    pub voice_type: Option<String>,
    pub system_voice_id: Option<String>,
    pub custom_voice_id: Option<String>,
    pub custom_api_key: Option<String>,
    pub text: Option<String>,
    pub emotion: Option<String>,
}
