//! LLM provider integration
//!
//! A [`Provider`] streams chat answers, transcribes audio and lists the
//! models/connectors of a remote service. Two wire dialects are supported
//! (chat-completions and cohere); [`CachedProvider`] decorates either one
//! with an on-disk transcription cache.

pub mod cache;
pub mod cohere;
pub mod mime;
pub mod mock;
pub mod openai;

pub use cache::{CacheIndex, CachedProvider};
pub use cohere::CohereProvider;
pub use mock::MockProvider;
pub use openai::OpenAiProvider;

use crate::config::{GenerationConfig, ProviderKind};
use crate::models::{AudioFile, AudioSegment, Conversation};
use crate::{Error, Result};
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Assistant output as raw bytes, in generation order.
pub type TextStream = Pin<Box<dyn AsyncRead + Send>>;

#[async_trait]
pub trait Provider: Send + Sync {
    /// Stream the answer to the last message of `conversation`.
    async fn stream(
        &self,
        config: &GenerationConfig,
        conversation: &Conversation,
    ) -> Result<TextStream>;

    /// Transcribe `audio` into ordered segments.
    async fn transcribe(
        &self,
        config: &GenerationConfig,
        audio: AudioFile,
    ) -> Result<Vec<AudioSegment>>;

    async fn list_models(&self) -> Result<Vec<String>>;

    async fn list_connectors(&self) -> Result<Vec<String>>;
}

/// Build the provider selected in the config, reading its API key from the
/// environment.
pub fn provider_from_env(kind: ProviderKind) -> Result<Arc<dyn Provider>> {
    dotenvy::dotenv().ok();

    let provider: Arc<dyn Provider> = match kind {
        ProviderKind::Groq => Arc::new(OpenAiProvider::groq(api_key(
            openai::GROQ_API_KEY,
            openai::GROQ_KEYS_URL,
        )?)),
        ProviderKind::Cohere => Arc::new(CohereProvider::new(api_key(
            cohere::COHERE_API_KEY,
            cohere::COHERE_KEYS_URL,
        )?)),
    };
    tracing::debug!("Using {} provider", kind);
    Ok(provider)
}

fn api_key(var: &'static str, url: &'static str) -> Result<String> {
    std::env::var(var)
        .ok()
        .filter(|key| !key.trim().is_empty())
        .ok_or(Error::Authentication { var, url })
}

/// Carry a provider error through the `io::Error` of a byte stream.
/// [`Error::from_stream`] recovers it on the reading side.
pub(crate) fn stream_error(err: Error) -> std::io::Error {
    std::io::Error::other(err)
}

/// Pass a successful response through; turn anything else into a provider error.
pub(crate) async fn check_status(
    dialect: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response.text().await?;
    tracing::error!("{} API error (status {}): {}", dialect, status, error_text);
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::RateLimited(error_text));
    }
    Err(Error::AiProvider(format!(
        "{} API error (status {}): {}",
        dialect, status, error_text
    )))
}

/// Decode a JSON body, logging the raw payload when it does not match.
pub(crate) async fn parse_json<T: serde::de::DeserializeOwned>(
    dialect: &str,
    response: reqwest::Response,
) -> Result<T> {
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| {
        tracing::error!("Failed to parse {} response: {}\nBody: {}", dialect, e, body);
        Error::AiProvider(format!("Failed to parse {} response: {}", dialect, e))
    })
}
