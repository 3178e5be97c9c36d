//! Chat-completions dialect (OpenAI-compatible), used for Groq.

pub mod audio;
pub mod chat;
pub mod client;
pub mod types;

pub use client::OpenAiHttpClient;

use crate::ai::{Provider, TextStream};
use crate::config::GenerationConfig;
use crate::models::{AudioFile, AudioSegment, Conversation};
use crate::Result;
use async_trait::async_trait;

pub const GROQ_API_KEY: &str = "GROQ_API_KEY";
pub const GROQ_KEYS_URL: &str = "https://console.groq.com/keys";
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

pub const DEFAULT_CHAT_MODEL: &str = "llama-3.1-8b-instant";
pub const DEFAULT_CHAT_IMAGE_MODEL: &str = "llava-v1.5-7b-4096-preview";
pub const DEFAULT_AUDIO_MODEL: &str = "whisper-large-v3";

pub struct OpenAiProvider {
    http: OpenAiHttpClient,
}

impl OpenAiProvider {
    pub fn groq(api_key: String) -> Self {
        Self {
            http: OpenAiHttpClient::new(api_key, GROQ_BASE_URL.to_string()),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.http = self.http.with_base_url(base_url);
        self
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn stream(
        &self,
        config: &GenerationConfig,
        conversation: &Conversation,
    ) -> Result<TextStream> {
        chat::stream_chat(&self.http, config, conversation).await
    }

    async fn transcribe(
        &self,
        config: &GenerationConfig,
        audio: AudioFile,
    ) -> Result<Vec<AudioSegment>> {
        audio::transcribe(&self.http, config, audio).await
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let models: types::ModelList = self.http.get("/models").await?;
        Ok(models.data.into_iter().map(|model| model.id).collect())
    }

    async fn list_connectors(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}
