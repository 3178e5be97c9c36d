//! Data models and structures
//!
//! Defines the conversation messages exchanged with providers and the audio
//! types used for transcription.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::io::AsyncRead;

/// Template used to fold piped context in front of a user prompt.
pub fn fold_context(context: &str, prompt: &str) -> String {
    if context.is_empty() {
        prompt.to_string()
    } else {
        format!("{}\n\n{}", context, prompt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text(String),
    /// `data:<mime>;base64,<payload>` URL.
    Image(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Text(String),
    /// Multi-part body; the first part is always text.
    Parts(Vec<MessagePart>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    role: Role,
    body: MessageBody,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            body: MessageBody::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            body: MessageBody::Text(text.into()),
        }
    }

    /// User message carrying a text question and an inline image.
    pub fn user_with_image(text: impl Into<String>, data_url: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            body: MessageBody::Parts(vec![
                MessagePart::Text(text.into()),
                MessagePart::Image(data_url.into()),
            ]),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn has_image(&self) -> bool {
        match &self.body {
            MessageBody::Text(_) => false,
            MessageBody::Parts(parts) => parts
                .iter()
                .any(|part| matches!(part, MessagePart::Image(_))),
        }
    }

    /// Concatenated text of the message, ignoring image parts.
    pub fn text(&self) -> String {
        match &self.body {
            MessageBody::Text(text) => text.clone(),
            MessageBody::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    MessagePart::Text(text) => Some(text.as_str()),
                    MessagePart::Image(_) => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Fold `prompt` into the leading text of the message, using the same
    /// template as piped context.
    pub fn splice_prompt(&mut self, prompt: &str) {
        match &mut self.body {
            MessageBody::Text(text) => *text = fold_context(text, prompt),
            MessageBody::Parts(parts) => {
                if let Some(MessagePart::Text(text)) = parts.first_mut() {
                    *text = fold_context(text, prompt);
                }
            }
        }
    }
}

/// Ordered messages, strictly alternating and starting with a user message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: Message) -> Result<()> {
        let expected = match self.messages.last() {
            None | Some(Message {
                role: Role::Assistant,
                ..
            }) => Role::User,
            Some(Message {
                role: Role::User, ..
            }) => Role::Assistant,
        };
        if message.role != expected {
            return Err(Error::Invariant(format!(
                "expected {} message at position {}, got {}",
                expected,
                self.messages.len(),
                message.role
            )));
        }
        self.messages.push(message);
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl TryFrom<Vec<Message>> for Conversation {
    type Error = Error;

    fn try_from(messages: Vec<Message>) -> Result<Self> {
        let mut conversation = Conversation::new();
        for message in messages {
            conversation.push(message)?;
        }
        Ok(conversation)
    }
}

/// Audio to transcribe; `path` doubles as the uploaded file name.
pub struct AudioFile {
    pub path: PathBuf,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl AudioFile {
    pub fn new(path: impl Into<PathBuf>, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            path: path.into(),
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(path: impl Into<PathBuf>, data: Vec<u8>) -> Self {
        Self::new(path, std::io::Cursor::new(data))
    }

    /// File name component of the path, used as the multipart file name.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string())
    }
}

impl fmt::Debug for AudioFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioFile")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSegment {
    pub text: String,
    pub seek: i64,
    pub start: f64,
    pub end: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversation_must_start_with_user() {
        let mut conversation = Conversation::new();
        let err = conversation.push(Message::assistant("hi")).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
        assert!(conversation.is_empty());
    }

    #[test]
    fn test_conversation_must_alternate() {
        let mut conversation = Conversation::new();
        conversation.push(Message::user("hello")).unwrap();
        assert!(conversation.push(Message::user("again")).is_err());
        conversation.push(Message::assistant("hi")).unwrap();
        conversation.push(Message::user("again")).unwrap();
        assert_eq!(conversation.len(), 3);
    }

    #[test]
    fn test_constructors_fix_role_and_leading_text() {
        assert_eq!(Message::user("q").role(), Role::User);
        assert_eq!(Message::assistant("a").role(), Role::Assistant);

        let message = Message::user_with_image("", "data:image/png;base64,AAAA");
        assert_eq!(message.role(), Role::User);
        match message.body() {
            MessageBody::Parts(parts) => assert_eq!(parts[0], MessagePart::Text(String::new())),
            body => panic!("expected multi-part body, got {:?}", body),
        }
    }

    #[test]
    fn test_splice_into_text_message_uses_context_template() {
        let mut message = Message::user("FILE_CONTENTS");
        message.splice_prompt("summarize");
        assert_eq!(*message.body(), MessageBody::Text("FILE_CONTENTS\n\nsummarize".to_string()));

        let mut empty = Message::user("");
        empty.splice_prompt("summarize");
        assert_eq!(*empty.body(), MessageBody::Text("summarize".to_string()));
    }

    #[test]
    fn test_splice_into_multipart_replaces_leading_text() {
        let mut message = Message::user_with_image("", "data:image/png;base64,AAAA");
        message.splice_prompt("what is this");

        assert_eq!(
            *message.body(),
            MessageBody::Parts(vec![
                MessagePart::Text("what is this".to_string()),
                MessagePart::Image("data:image/png;base64,AAAA".to_string()),
            ])
        );
        assert!(message.has_image());
        assert_eq!(message.text(), "what is this");
    }

    #[test]
    fn test_audio_file_name_from_path() {
        let audio = AudioFile::from_bytes("/tmp/recordings/a.mp3", vec![1, 2, 3]);
        assert_eq!(audio.file_name(), "a.mp3");
    }
}
