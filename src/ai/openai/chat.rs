use super::client::OpenAiHttpClient;
use super::types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatMessage, ChatMessageContent, ImageUrl,
    MessagePart as WirePart,
};
use super::{DEFAULT_CHAT_IMAGE_MODEL, DEFAULT_CHAT_MODEL};
use crate::ai::{stream_error, TextStream};
use crate::config::{Capability, GenerationConfig};
use crate::models::{Conversation, Message, MessageBody, MessagePart, Role};
use crate::{Error, Result};
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use std::io;
use std::pin::Pin;
use tokio_util::io::StreamReader;

const DONE: &str = "[DONE]";

type Deltas = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// What a single server-sent event contributes to the answer.
#[derive(Debug, PartialEq)]
enum Step {
    Text(String),
    Skip,
    Done,
}

pub(crate) async fn stream_chat(
    http: &OpenAiHttpClient,
    config: &GenerationConfig,
    conversation: &Conversation,
) -> Result<TextStream> {
    let request = build_request(config, conversation);
    tracing::debug!(
        "Streaming chat completion: model={}, messages={}",
        request.model,
        request.messages.len()
    );

    let response = http.post_streaming("/chat/completions", &request).await?;
    let deltas = text_deltas(response.bytes_stream().eventsource());
    Ok(Box::pin(StreamReader::new(deltas)))
}

pub(crate) fn build_request(
    config: &GenerationConfig,
    conversation: &Conversation,
) -> ChatCompletionRequest {
    let wants_image = conversation.last().is_some_and(Message::has_image);
    let model = if wants_image {
        config.model_or(Capability::ChatImage, DEFAULT_CHAT_IMAGE_MODEL)
    } else {
        config.model_or(Capability::Chat, DEFAULT_CHAT_MODEL)
    };
    if config.top_k.is_some() {
        tracing::debug!("top_k is not supported by the chat-completions API, ignoring");
    }

    ChatCompletionRequest {
        model: model.to_string(),
        messages: conversation.messages().iter().map(wire_message).collect(),
        stream: true,
        temperature: config.temperature,
        top_p: config.top_p,
        frequency_penalty: config.frequency_penalty,
        presence_penalty: config.presence_penalty,
    }
}

fn wire_message(message: &Message) -> ChatMessage {
    let role = match message.role() {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    let content = match message.body() {
        MessageBody::Text(text) => ChatMessageContent::Text(text.clone()),
        MessageBody::Parts(parts) => ChatMessageContent::Parts(
            parts
                .iter()
                .map(|part| match part {
                    MessagePart::Text(text) => WirePart {
                        part_type: "text".to_string(),
                        text: Some(text.clone()),
                        image_url: None,
                    },
                    MessagePart::Image(url) => WirePart {
                        part_type: "image_url".to_string(),
                        text: None,
                        image_url: Some(ImageUrl { url: url.clone() }),
                    },
                })
                .collect(),
        ),
    };
    ChatMessage {
        role: role.to_string(),
        content,
    }
}

fn parse_event(data: &str) -> Result<Step> {
    if data.trim() == DONE {
        return Ok(Step::Done);
    }

    let event: serde_json::Value = serde_json::from_str(data)?;
    if let Some(error) = event.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        tracing::error!("OpenAI stream error: {}", message);
        return Err(Error::AiProvider(format!("OpenAI stream error: {}", message)));
    }

    let chunk: ChatCompletionChunk = serde_json::from_value(event)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|text| !text.is_empty())
        .map_or(Step::Skip, Step::Text))
}

/// Turn server-sent events into text deltas, ending at `[DONE]` or the first error.
fn text_deltas<S, E>(events: S) -> Deltas
where
    S: Stream<Item = std::result::Result<eventsource_stream::Event, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let events = Box::pin(events);
    let deltas = futures::stream::unfold(Some(events), |state| async move {
        let mut events = state?;
        loop {
            let event = match events.next().await? {
                Ok(event) => event,
                Err(e) => {
                    let err = Error::AiProvider(format!("SSE stream error: {}", e));
                    return Some((Err(stream_error(err)), None));
                }
            };
            match parse_event(&event.data) {
                Ok(Step::Text(text)) => return Some((Ok(Bytes::from(text)), Some(events))),
                Ok(Step::Skip) => continue,
                Ok(Step::Done) => return None,
                Err(e) => return Some((Err(stream_error(e)), None)),
            }
        }
    });
    Box::pin(deltas)
}
