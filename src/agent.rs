//! Agent Configuration
//!
//! The pipeline providers (STT, LLM, TTS) chosen for a call, and the
//! directory contract that resolves a dialed number to an agent. Directory
//! storage lives outside the core; a static in-memory directory covers the
//! binary and tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Speech-to-text provider settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SttConfig {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// Language-model provider settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Text-to-speech backends with known native output rates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsVendor {
    Polly,
    ElevenLabs,
    Azure,
}

impl TtsVendor {
    /// Sample rate the vendor synthesizes at. The bridge records this once
    /// per call instead of re-querying the pipeline for every chunk.
    pub fn native_sample_rate(&self) -> u32 {
        match self {
            TtsVendor::Polly => 8_000,
            TtsVendor::ElevenLabs => 22_050,
            TtsVendor::Azure => 44_100,
        }
    }
}

/// Text-to-speech provider settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsConfig {
    pub vendor: TtsVendor,
    #[serde(default)]
    pub voice: Option<String>,
}

/// Everything the manager needs to build a pipeline for one call.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub name: String,
    pub system_prompt: String,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
}

/// Fallback pipeline providers from the service config.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDefaults {
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            stt: SttConfig {
                provider: "whisper".to_string(),
                model: None,
                language: None,
            },
            llm: LlmConfig {
                provider: "llama".to_string(),
                model: Some("llama3.2:3b".to_string()),
                temperature: None,
            },
            tts: TtsConfig {
                vendor: TtsVendor::ElevenLabs,
                voice: None,
            },
        }
    }
}

impl PipelineDefaults {
    /// Build the fallback agent used when the directory has no match.
    pub fn fallback_agent(&self, system_prompt: Option<&str>) -> AgentConfig {
        AgentConfig {
            name: "default".to_string(),
            system_prompt: system_prompt
                .unwrap_or("You are a helpful voice assistant.")
                .to_string(),
            stt: self.stt.clone(),
            llm: self.llm.clone(),
            tts: self.tts.clone(),
        }
    }
}

/// Resolves the agent configured for a dialed number.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn lookup_agent_for_number(&self, to: &str) -> Option<AgentConfig>;
}

/// In-memory directory keyed by E.164 number.
#[derive(Default)]
pub struct StaticAgentDirectory {
    agents: HashMap<String, AgentConfig>,
}

impl StaticAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, number: impl Into<String>, agent: AgentConfig) {
        self.agents.insert(number.into(), agent);
    }
}

#[async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn lookup_agent_for_number(&self, to: &str) -> Option<AgentConfig> {
        self.agents.get(to).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_sample_rates() {
        assert_eq!(TtsVendor::Polly.native_sample_rate(), 8_000);
        assert_eq!(TtsVendor::ElevenLabs.native_sample_rate(), 22_050);
        assert_eq!(TtsVendor::Azure.native_sample_rate(), 44_100);
    }

    #[tokio::test]
    async fn test_static_directory_lookup() {
        let mut directory = StaticAgentDirectory::new();
        let defaults = PipelineDefaults::default();
        directory.insert("+15550002", defaults.fallback_agent(Some("Front desk.")));

        let hit = directory.lookup_agent_for_number("+15550002").await;
        assert_eq!(hit.unwrap().system_prompt, "Front desk.");
        assert!(directory.lookup_agent_for_number("+15550003").await.is_none());
    }

    #[test]
    fn test_fallback_agent_uses_config_prompt() {
        let defaults = PipelineDefaults::default();
        let agent = defaults.fallback_agent(None);
        assert_eq!(agent.name, "default");
        assert_eq!(agent.tts.vendor, TtsVendor::ElevenLabs);
    }
}
