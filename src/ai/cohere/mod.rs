//! Cohere chat dialect: newline-delimited JSON streaming, model and
//! connector listing. Transcription and image input are not available.

pub mod types;

use crate::ai::{check_status, parse_json, stream_error, Provider, TextStream};
use crate::config::{Capability, GenerationConfig};
use crate::models::{AudioFile, AudioSegment, Conversation, Message, Role};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::io;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use types::{ChatMessage, ChatRequest, Connector, ConnectorList, ModelList, StreamEvent};

pub const COHERE_API_KEY: &str = "COHERE_API_KEY";
pub const COHERE_KEYS_URL: &str = "https://dashboard.cohere.com/api-keys";
pub const COHERE_BASE_URL: &str = "https://api.cohere.com";

const DIALECT: &str = "Cohere";

pub struct CohereProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl CohereProvider {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: COHERE_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let response = check_status(DIALECT, response).await?;
        parse_json(DIALECT, response).await
    }
}

fn wire_role(role: Role) -> &'static str {
    match role {
        Role::User => "USER",
        Role::Assistant => "CHATBOT",
    }
}

fn build_request(config: &GenerationConfig, conversation: &Conversation) -> Result<ChatRequest> {
    let messages = conversation.messages();
    let (last, history) = messages
        .split_last()
        .ok_or_else(|| Error::Invariant("cannot stream an empty conversation".to_string()))?;

    if messages.iter().any(Message::has_image) {
        return Err(Error::Unsupported {
            provider: DIALECT,
            capability: "image input",
        });
    }

    Ok(ChatRequest {
        message: last.text(),
        chat_history: history
            .iter()
            .map(|message| ChatMessage {
                role: wire_role(message.role()),
                message: message.text(),
            })
            .collect(),
        stream: true,
        model: config.model_for(Capability::Chat).map(str::to_string),
        temperature: config.temperature,
        p: config.top_p,
        k: config.top_k,
        frequency_penalty: config.frequency_penalty,
        presence_penalty: config.presence_penalty,
        connectors: config
            .connectors
            .iter()
            .map(|id| Connector { id: id.clone() })
            .collect(),
    })
}

/// Decode one event line. `None` ends the stream.
fn parse_line(line: &str) -> Result<Option<String>> {
    if line.trim().is_empty() {
        return Ok(Some(String::new()));
    }
    let event: StreamEvent = serde_json::from_str(line)?;
    match event.event_type.as_str() {
        "text-generation" => Ok(Some(event.text.unwrap_or_default())),
        "stream-end" => match event.finish_reason.as_deref() {
            Some(reason) if reason.starts_with("ERROR") => {
                tracing::error!("Cohere stream ended with {}", reason);
                Err(Error::AiProvider(format!("Cohere stream ended with {}", reason)))
            }
            _ => Ok(None),
        },
        other => {
            tracing::trace!("Skipping Cohere event {}", other);
            Ok(Some(String::new()))
        }
    }
}

#[async_trait]
impl Provider for CohereProvider {
    async fn stream(
        &self,
        config: &GenerationConfig,
        conversation: &Conversation,
    ) -> Result<TextStream> {
        let request = build_request(config, conversation)?;
        tracing::debug!(
            "Streaming Cohere chat: model={}, history={}",
            request.model.as_deref().unwrap_or("default"),
            request.chat_history.len()
        );

        let response = self
            .client
            .post(format!("{}/v1/chat", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Failed to send request to {}: {}", DIALECT, e);
                e
            })?;
        let response = check_status(DIALECT, response).await?;

        let body = StreamReader::new(response.bytes_stream().map_err(io::Error::other));
        let lines = Box::pin(FramedRead::new(body, LinesCodec::new()));

        let deltas = futures::stream::unfold(Some(lines), |state| async move {
            let mut lines = state?;
            loop {
                let line = match lines.next().await? {
                    Ok(line) => line,
                    Err(e) => return Some((Err(io::Error::other(e)), None)),
                };
                match parse_line(&line) {
                    Ok(Some(text)) if text.is_empty() => continue,
                    Ok(Some(text)) => return Some((Ok(Bytes::from(text)), Some(lines))),
                    Ok(None) => return None,
                    Err(e) => return Some((Err(stream_error(e)), None)),
                }
            }
        });

        Ok(Box::pin(StreamReader::new(Box::pin(deltas))))
    }

    async fn transcribe(
        &self,
        _config: &GenerationConfig,
        _audio: AudioFile,
    ) -> Result<Vec<AudioSegment>> {
        Err(Error::Unsupported {
            provider: DIALECT,
            capability: "transcription",
        })
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        let models: ModelList = self.get("/v1/models?endpoint=chat").await?;
        Ok(models.models.into_iter().map(|model| model.name).collect())
    }

    async fn list_connectors(&self) -> Result<Vec<String>> {
        let connectors: ConnectorList = self.get("/v1/connectors").await?;
        Ok(connectors
            .connectors
            .into_iter()
            .map(|connector| connector.id)
            .collect())
    }
}
