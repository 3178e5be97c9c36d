use serde::{Deserialize, Serialize};

/// Streamed chat request (`POST /v1/chat`).
#[derive(Debug, Serialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub chat_history: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connectors: Vec<Connector>,
}

/// History entry; `role` is `USER` or `CHATBOT`.
#[derive(Debug, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
}

/// One newline-delimited event of a streamed chat.
#[derive(Debug, Deserialize)]
pub struct StreamEvent {
    pub event_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ModelList {
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ModelEntry {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ConnectorList {
    #[serde(default)]
    pub connectors: Vec<Connector>,
}
