//! Persisted user configuration
//!
//! The config lives at `~/.cmd/config.json`. It selects the provider, whether
//! transcriptions are recorded to the local cache, and the generation knobs
//! forwarded with every request.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_PATH: &str = ".cmd/config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Groq,
    Cohere,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Groq => write!(f, "groq"),
            ProviderKind::Cohere => write!(f, "cohere"),
        }
    }
}

/// Coarse label for what a model can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Chat,
    ChatImage,
    SpeechToText,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Chat => write!(f, "chat"),
            Capability::ChatImage => write!(f, "chat-image"),
            Capability::SpeechToText => write!(f, "speech-to-text"),
        }
    }
}

// Order matters: vision variants of chat families must win over the family marker.
const KNOWN_MODELS: &[(&str, Capability)] = &[
    ("whisper", Capability::SpeechToText),
    ("llava", Capability::ChatImage),
    ("vision", Capability::ChatImage),
    ("command", Capability::Chat),
    ("gemma", Capability::Chat),
    ("llama", Capability::Chat),
    ("mixtral", Capability::Chat),
    ("mistral", Capability::Chat),
    ("qwen", Capability::Chat),
];

/// Infer the capability of a model from its identifier.
pub fn model_capability(model: &str) -> Result<Capability> {
    KNOWN_MODELS
        .iter()
        .find(|(marker, _)| model.contains(marker))
        .map(|(_, capability)| *capability)
        .ok_or_else(|| Error::ModelClassification(model.to_string()))
}

/// Sampling knobs, model selection and connectors sent along with requests.
///
/// Every knob is optional; an absent value leaves the provider default in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model: BTreeMap<Capability, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connectors: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
}

impl GenerationConfig {
    /// Model configured for `capability`, if any.
    pub fn model_for(&self, capability: Capability) -> Option<&str> {
        self.model
            .get(&capability)
            .map(String::as_str)
            .filter(|model| !model.is_empty())
    }

    /// Model configured for `capability`, falling back to `default`.
    pub fn model_or<'a>(&'a self, capability: Capability, default: &'a str) -> &'a str {
        self.model_for(capability).unwrap_or(default)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_record")]
    pub record: bool,
    #[serde(flatten)]
    pub generation: GenerationConfig,
}

fn default_record() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Groq,
            record: true,
            generation: GenerationConfig::default(),
        }
    }
}

impl Config {
    /// Default location of the config file under the user's home directory.
    pub fn default_path() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(CONFIG_PATH))
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))
    }

    /// Read the config at `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_str(&data).map_err(|e| {
            Error::Config(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    /// Rewrite the config at `path` atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = self.to_json()?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        tracing::debug!("Saved config to {}", path.display());
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Store `model` under the capability it is classified as.
    pub fn set_model(&mut self, model: &str) -> Result<Capability> {
        let capability = model_capability(model)?;
        self.generation
            .model
            .insert(capability, model.to_string());
        Ok(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn test_model_capability_table() {
        assert_eq!(
            model_capability("whisper-large-v3").unwrap(),
            Capability::SpeechToText
        );
        assert_eq!(
            model_capability("llama-3.1-8b-instant").unwrap(),
            Capability::Chat
        );
        assert_eq!(
            model_capability("command-r-plus").unwrap(),
            Capability::Chat
        );
        assert_eq!(
            model_capability("llava-v1.5-7b-4096-preview").unwrap(),
            Capability::ChatImage
        );
        assert_eq!(
            model_capability("llama-3.2-11b-vision-preview").unwrap(),
            Capability::ChatImage
        );
    }

    #[test]
    fn test_unknown_model_fails_classification() {
        let err = model_capability("gpt-unknown").unwrap_err();
        assert!(matches!(err, Error::ModelClassification(ref m) if m == "gpt-unknown"));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.record);
        assert_eq!(config.provider, ProviderKind::Groq);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::default();
        config.provider = ProviderKind::Cohere;
        config.set_model("command-r").unwrap();
        config.generation.connectors = vec!["web-search".to_string()];
        config.generation.temperature = Some(0.3);
        config.generation.top_k = Some(40);
        config.save(&path).unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_wire_format_matches_persisted_layout() {
        let mut config = Config::default();
        config.set_model("whisper-large-v3").unwrap();
        config.generation.top_p = Some(0.9);

        let json: serde_json::Value = serde_json::from_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "provider": "groq",
                "record": true,
                "model": { "speech-to-text": "whisper-large-v3" },
                "top_p": 0.9
            })
        );
    }

    #[test]
    fn test_unknown_provider_is_config_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"provider": "acme"}"#).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_model_or_falls_back_to_default() {
        let mut generation = GenerationConfig::default();
        assert_eq!(generation.model_or(Capability::Chat, "fallback"), "fallback");

        generation
            .model
            .insert(Capability::Chat, "llama3-70b".to_string());
        assert_eq!(generation.model_or(Capability::Chat, "fallback"), "llama3-70b");
        assert_eq!(generation.model_for(Capability::ChatImage), None);
    }
}
