use serde_json::json;
use tracing::debug;

use crate::config::TtsConfig;
use crate::error::{GatewayError, Result};
use crate::types::TtsProxyRequest;

use super::UpstreamTarget;

/// Prosody applied to the synthesized voice.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceSettings {
    pub speed: f64,
    pub vol: f64,
    pub pitch: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emotion {
    Angry,
    Sad,
    Happy,
    Fearful,
    Surprised,
    Neutral,
}

impl Emotion {
    /// Unknown or missing emotions read as neutral.
    pub fn parse(name: Option<&str>) -> Self {
        match name {
            Some("angry") => Emotion::Angry,
            Some("sad") => Emotion::Sad,
            Some("happy") => Emotion::Happy,
            Some("fearful") => Emotion::Fearful,
            Some("surprised") => Emotion::Surprised,
            _ => Emotion::Neutral,
        }
    }

    pub fn settings(&self) -> VoiceSettings {
        let (speed, vol, pitch) = match self {
            Emotion::Angry => (1.1, 1.2, -1),
            Emotion::Sad => (0.9, 0.9, -1),
            Emotion::Happy => (1.1, 1.1, 1),
            Emotion::Fearful => (1.15, 0.9, 1),
            Emotion::Surprised => (1.0, 1.0, 1),
            Emotion::Neutral => (1.0, 1.0, 0),
        };
        VoiceSettings { speed, vol, pitch }
    }
}

/// Audio format requested from the synthesis vendor.
const SAMPLE_RATE: u32 = 24_000;
const BITRATE: u32 = 128_000;
const FORMAT: &str = "mp3";

/// A validated synthesis request ready to be sent upstream.
#[derive(Debug, Clone)]
pub struct TtsCall {
    pub target: UpstreamTarget,
    pub voice_id: String,
    pub body: serde_json::Value,
}

impl TtsCall {
    /// Validate the client payload, pick the credential and voice, and
    /// build the vendor request.
    ///
    /// `custom` voices bring their own key and voice id. Any other voice
    /// type uses the configured key with the requested or default voice.
    pub fn build(request: &TtsProxyRequest, config: &TtsConfig) -> Result<Self> {
        let text = request.text.as_deref().filter(|s| !s.is_empty());
        let voice_type = request.voice_type.as_deref().filter(|s| !s.is_empty());
        let (text, voice_type) = match (text, voice_type) {
            (Some(t), Some(v)) => (t, v),
            _ => {
                return Err(GatewayError::InvalidRequest(
                    "text and voiceType are required".to_string(),
                ))
            }
        };

        let (api_key, voice_id) = if voice_type == "custom" {
            let key = request.custom_api_key.as_deref().filter(|s| !s.is_empty());
            let voice = request.custom_voice_id.as_deref().filter(|s| !s.is_empty());
            match (key, voice) {
                (Some(k), Some(v)) => (k.to_string(), v.to_string()),
                _ => {
                    return Err(GatewayError::InvalidRequest(
                        "custom voice requires customApiKey and customVoiceId".to_string(),
                    ))
                }
            }
        } else {
            if config.api_key.is_empty() {
                return Err(GatewayError::misconfigured("MINIMAX_API_KEY"));
            }
            let voice = request
                .system_voice_id
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or(&config.default_voice_id);
            (config.api_key.clone(), voice.to_string())
        };

        if config.group_id.is_empty() {
            return Err(GatewayError::misconfigured("MINIMAX_GROUP_ID"));
        }

        let endpoint = format!("{}/v1/t2a_v2", config.api_base.trim_end_matches('/'));
        let url = reqwest::Url::parse_with_params(&endpoint, &[("GroupId", config.group_id.as_str())])
            .map_err(|e| GatewayError::misconfigured(format!("tts.apiBase ({})", e)))?;

        let emotion = Emotion::parse(request.emotion.as_deref());
        let VoiceSettings { speed, vol, pitch } = emotion.settings();
        let body = json!({
            "model": config.model,
            "text": text,
            "voice_setting": {
                "voice_id": voice_id,
                "speed": speed,
                "vol": vol,
                "pitch": pitch,
            },
            "audio_setting": {
                "sample_rate": SAMPLE_RATE,
                "bitrate": BITRATE,
                "format": FORMAT,
            },
        });
        debug!("Built TTS request: voice {} emotion {:?} ({} chars)", voice_id, emotion, text.chars().count());

        Ok(Self {
            target: UpstreamTarget {
                url: url.to_string(),
                api_key,
            },
            voice_id,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TtsConfig {
        TtsConfig {
            api_key: "mm-key".to_string(),
            group_id: "g-42".to_string(),
            ..Default::default()
        }
    }

    fn request() -> TtsProxyRequest {
        TtsProxyRequest {
            voice_type: Some("system".to_string()),
            text: Some("hello there".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_emotion_table() {
        assert_eq!(
            Emotion::parse(Some("fearful")).settings(),
            VoiceSettings { speed: 1.15, vol: 0.9, pitch: 1 }
        );
        assert_eq!(Emotion::parse(Some("angry")).settings().pitch, -1);
        assert_eq!(Emotion::parse(Some("bored")), Emotion::Neutral);
        assert_eq!(Emotion::parse(None).settings(), VoiceSettings { speed: 1.0, vol: 1.0, pitch: 0 });
    }

    #[test]
    fn test_system_voice_defaults() {
        let call = TtsCall::build(&request(), &config()).unwrap();
        assert_eq!(call.voice_id, "female-yujie");
        assert_eq!(call.target.api_key, "mm-key");
        assert_eq!(call.target.url, "https://api.minimaxi.com/v1/t2a_v2?GroupId=g-42");
        assert_eq!(call.body["model"], "speech-02-hd");
        assert_eq!(call.body["voice_setting"]["pitch"], 0);
        assert_eq!(call.body["audio_setting"]["sample_rate"], 24_000);
        assert_eq!(call.body["audio_setting"]["format"], "mp3");
    }

    #[test]
    fn test_custom_voice_uses_client_key() {
        let mut req = request();
        req.voice_type = Some("custom".to_string());
        req.custom_api_key = Some("client-key".to_string());
        req.custom_voice_id = Some("my-voice".to_string());
        req.emotion = Some("sad".to_string());

        let call = TtsCall::build(&req, &config()).unwrap();
        assert_eq!(call.target.api_key, "client-key");
        assert_eq!(call.body["voice_setting"]["voice_id"], "my-voice");
        assert_eq!(call.body["voice_setting"]["speed"], 0.9);

        req.custom_voice_id = None;
        assert!(matches!(
            TtsCall::build(&req, &config()),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_required_fields_and_config() {
        let mut req = request();
        req.text = None;
        assert!(matches!(
            TtsCall::build(&req, &config()),
            Err(GatewayError::InvalidRequest(_))
        ));

        let mut cfg = config();
        cfg.group_id.clear();
        let err = TtsCall::build(&request(), &cfg).unwrap_err();
        assert!(matches!(err, GatewayError::ServerMisconfigured { ref key } if key == "MINIMAX_GROUP_ID"));

        let mut cfg = config();
        cfg.api_key.clear();
        let err = TtsCall::build(&request(), &cfg).unwrap_err();
        assert!(matches!(err, GatewayError::ServerMisconfigured { ref key } if key == "MINIMAX_API_KEY"));
    }
}
