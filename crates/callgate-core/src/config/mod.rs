use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::provider::LlmVendor;

/// Root configuration for callgate. Built once at startup and shared
/// read-only (behind `Arc`) by every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[derive(Default)]
pub struct Config {
    pub handshake: HandshakeConfig,
    pub providers: ProvidersConfig,
    pub tts: TtsConfig,
    pub gateway: GatewayConfig,
    pub store: StoreConfig,
}

impl Config {
    /// Check the configuration before serving.
    ///
    /// Missing root secret is fatal. Missing vendor credentials only disable
    /// that vendor and are returned as warnings.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        if self.handshake.root_key.is_empty() {
            return Err(ConfigError::Missing(vec!["CLIENT_ROOT_KEY".to_string()]));
        }
        if self.handshake.freshness_window_secs <= 0 {
            return Err(ConfigError::Invalid(
                "handshake.freshnessWindowSecs must be positive".to_string(),
            ));
        }
        if self.gateway.upstream_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "gateway.upstreamTimeoutSecs must be positive".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Dynamodb && self.store.table.is_none() {
            return Err(ConfigError::Missing(vec!["DYNAMODB_TABLE".to_string()]));
        }

        let mut warnings = Vec::new();
        for vendor in LlmVendor::ALL {
            if self.providers.get(vendor).api_key.is_empty() {
                warnings.push(format!("{} is not set, {} requests will fail", vendor.env_key(), vendor));
            }
        }
        if self.tts.api_key.is_empty() {
            warnings.push("MINIMAX_API_KEY is not set, system voice requests will fail".to_string());
        }
        if self.tts.group_id.is_empty() {
            warnings.push("MINIMAX_GROUP_ID is not set, all voice requests will fail".to_string());
        }
        Ok(warnings)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HandshakeConfig {
    /// HMAC secret shared with the client build.
    pub root_key: String,
    pub freshness_window_secs: i64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            root_key: String::new(),
            freshness_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[derive(Default)]
pub struct ProvidersConfig {
    pub deepseek: ProviderConfig,
    pub siliconflow: ProviderConfig,
    pub gemini: ProviderConfig,
}

impl ProvidersConfig {
    pub fn get(&self, vendor: LlmVendor) -> &ProviderConfig {
        match vendor {
            LlmVendor::DeepSeek => &self.deepseek,
            LlmVendor::SiliconFlow => &self.siliconflow,
            LlmVendor::Gemini => &self.gemini,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[derive(Default)]
pub struct ProviderConfig {
    pub api_key: String,
    /// Full chat-completions URL. The vendor default is used when absent.
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TtsConfig {
    pub api_key: String,
    pub group_id: String,
    pub default_voice_id: String,
    pub api_base: String,
    pub model: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            group_id: String::new(),
            default_voice_id: "female-yujie".to_string(),
            api_base: "https://api.minimaxi.com".to_string(),
            model: "speech-02-hd".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionTokenMode {
    /// Any non-empty token header passes.
    Presence,
    /// Only tokens minted by this process and not yet expired pass.
    Bound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub upstream_timeout_secs: u64,
    pub default_history_limit: i64,
    pub session_tokens: SessionTokenMode,
    pub session_token_ttl_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            upstream_timeout_secs: 60,
            default_history_limit: 15,
            session_tokens: SessionTokenMode::Presence,
            session_token_ttl_secs: 86_400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
    Dynamodb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Records file for the `file` backend (default `~/.callgate/records.json`).
    pub path: Option<PathBuf>,
    /// Table name for the `dynamodb` backend.
    pub table: Option<String>,
    /// Records document loaded into the `memory` backend at startup.
    pub seed: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            path: None,
            table: None,
            seed: None,
        }
    }
}

impl StoreConfig {
    pub fn file_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| get_data_dir().join("records.json"))
    }
}

// ====== Config loading ======

/// Load configuration from environment variables.
///
/// Priority:
/// 1. `CALLGATE_CONFIG` env var: full JSON config
/// 2. Individual env vars (merged on top of the file config)
/// 3. File fallback (`~/.callgate/config.json`)
pub fn load_config_from_env() -> Config {
    if let Ok(json) = std::env::var("CALLGATE_CONFIG") {
        match serde_json::from_str::<Config>(&json) {
            Ok(config) => return config,
            Err(e) => {
                tracing::warn!("Failed to parse CALLGATE_CONFIG: {}", e);
            }
        }
    }

    let mut cfg = load_config(None);
    apply_env_overrides(&mut cfg);
    cfg
}

/// Overlay individual environment variables on an existing config.
pub fn apply_env_overrides(cfg: &mut Config) {
    fn env(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }

    if let Some(v) = env("CLIENT_ROOT_KEY") {
        cfg.handshake.root_key = v;
    }

    // Vendor credentials
    if let Some(v) = env("DEEPSEEK_API_KEY") {
        cfg.providers.deepseek.api_key = v;
    }
    if let Some(v) = env("SILICONFLOW_API_KEY") {
        cfg.providers.siliconflow.api_key = v;
    }
    if let Some(v) = env("GEMINI_API_KEY") {
        cfg.providers.gemini.api_key = v;
    }

    // MiniMax
    if let Some(v) = env("MINIMAX_API_KEY") {
        cfg.tts.api_key = v;
    }
    if let Some(v) = env("MINIMAX_GROUP_ID") {
        cfg.tts.group_id = v;
    }
    if let Some(v) = env("MINIMAX_DEFAULT_VOICE_ID") {
        cfg.tts.default_voice_id = v;
    }

    // Gateway
    if let Some(v) = env("CALLGATE_HOST") {
        cfg.gateway.host = v;
    }
    if let Some(port) = env("PORT").and_then(|v| v.parse().ok()) {
        cfg.gateway.port = port;
    }
    if let Some(secs) = env("UPSTREAM_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        cfg.gateway.upstream_timeout_secs = secs;
    }
    match env("CALLGATE_SESSION_TOKENS").as_deref() {
        Some("bound") => cfg.gateway.session_tokens = SessionTokenMode::Bound,
        Some("presence") => cfg.gateway.session_tokens = SessionTokenMode::Presence,
        Some(other) => tracing::warn!("Ignoring unknown CALLGATE_SESSION_TOKENS value: {}", other),
        None => {}
    }

    // Store
    match env("CALLGATE_STORE").as_deref() {
        Some("memory") => cfg.store.backend = StoreBackend::Memory,
        Some("file") => cfg.store.backend = StoreBackend::File,
        Some("dynamodb") => cfg.store.backend = StoreBackend::Dynamodb,
        Some(other) => tracing::warn!("Ignoring unknown CALLGATE_STORE value: {}", other),
        None => {}
    }
    if let Some(v) = env("CALLGATE_STORE_PATH") {
        cfg.store.path = Some(PathBuf::from(v));
    }
    if let Some(v) = env("CALLGATE_STORE_SEED") {
        cfg.store.seed = Some(PathBuf::from(v));
    }
    if let Some(v) = env("DYNAMODB_TABLE") {
        cfg.store.table = Some(v);
    }
}

/// Get the default configuration file path.
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".callgate")
        .join("config.json")
}

/// Get the callgate data directory.
pub fn get_data_dir() -> PathBuf {
    let path = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".callgate");
    std::fs::create_dir_all(&path).ok();
    path
}

/// Load configuration from file or fall back to defaults.
pub fn load_config(config_path: Option<&Path>) -> Config {
    let path = config_path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(get_config_path);

    if path.exists() {
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Config>(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to parse config from {}: {}", path.display(), e);
                    tracing::warn!("Using default configuration.");
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config from {}: {}", path.display(), e);
                tracing::warn!("Using default configuration.");
            }
        }
    }

    Config::default()
}

/// Strict variant of [`load_config`] for explicit `--config` paths.
pub fn load_config_strict(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(serde_json::from_str(&content)?)
}
