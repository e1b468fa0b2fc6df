//! Service Configuration
//!
//! One JSON document selects the provider adapter, carries its credentials,
//! and supplies the pipeline fallbacks used when no agent matches a dialed
//! number. The path comes from the first CLI argument or `TELEPHONY_CONFIG`.

use crate::agent::PipelineDefaults;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Supported telephony carriers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderKind {
    PlivoLike,
    TataLike,
}

impl ProviderKind {
    /// Short tag used in internal call ids and URL paths.
    pub fn tag(&self) -> &'static str {
        match self {
            ProviderKind::PlivoLike => "plivo",
            ProviderKind::TataLike => "tata",
        }
    }

    /// Process-wide unique call id from a provider-assigned one.
    pub fn internal_call_id(&self, provider_call_id: &str) -> String {
        format!("{}_{}", self.tag(), provider_call_id)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// HTTP-Basic credentials for the provider REST API.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub auth_id: String,
    pub auth_token: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelephonyConfig {
    /// Which adapter to run.
    pub provider: ProviderKind,

    /// Required for providers with a REST surface (PlivoLike).
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// Public base URL the carrier calls back on; the media stream URL is
    /// derived from it (https maps to wss).
    pub webhook_base_url: String,

    /// Caller id used by `make_call` when the caller omits one.
    #[serde(default)]
    pub default_from_number: Option<String>,

    /// Pipeline provider fallbacks when no agent matches the dialed number.
    #[serde(default)]
    pub defaults: PipelineDefaults,

    /// Fallback system prompt when no agent matches.
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Override for the provider REST API base (tests, staging).
    #[serde(default)]
    pub api_base_url: Option<String>,

    /// Media WebSocket listener address.
    #[serde(default = "default_media_bind_addr")]
    pub media_bind_addr: String,

    /// Webhook HTTP listener address.
    #[serde(default = "default_http_bind_addr")]
    pub http_bind_addr: String,
}

fn default_media_bind_addr() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_http_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl TelephonyConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: TelephonyConfig = serde_json::from_str(
            r#"{
                "provider": "tataLike",
                "webhookBaseUrl": "https://voice.example.com"
            }"#,
        )
        .unwrap();
        assert_eq!(config.provider, ProviderKind::TataLike);
        assert!(config.credentials.is_none());
        assert_eq!(config.media_bind_addr, "0.0.0.0:8090");
    }

    #[test]
    fn test_parse_full_config() {
        let config: TelephonyConfig = serde_json::from_str(
            r#"{
                "provider": "plivoLike",
                "credentials": {"authId": "MA123", "authToken": "secret"},
                "webhookBaseUrl": "https://voice.example.com",
                "defaultFromNumber": "+15550100",
                "systemPrompt": "You are a helpful receptionist.",
                "defaults": {
                    "stt": {"provider": "whisper"},
                    "llm": {"provider": "llama", "model": "llama3.2:3b"},
                    "tts": {"vendor": "elevenlabs"}
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.provider, ProviderKind::PlivoLike);
        assert_eq!(config.credentials.unwrap().auth_id, "MA123");
        assert_eq!(config.defaults.tts.vendor.native_sample_rate(), 22_050);
    }

    #[test]
    fn test_internal_call_id() {
        assert_eq!(ProviderKind::PlivoLike.internal_call_id("c1"), "plivo_c1");
        assert_eq!(ProviderKind::TataLike.internal_call_id("CA9"), "tata_CA9");
    }
}
