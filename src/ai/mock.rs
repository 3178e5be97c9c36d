use super::{Provider, TextStream};
use crate::config::GenerationConfig;
use crate::models::{AudioFile, AudioSegment, Conversation};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
struct ScriptedTranscription {
    segments: Vec<AudioSegment>,
    delay: Duration,
    /// Errors returned, one per call, before the segments are.
    failures: Vec<String>,
    fatal: Option<String>,
}

/// Scripted provider for tests and offline harnesses.
///
/// Each streamed answer is delivered as the given chunks, one chunk per read.
/// Transcriptions are keyed by file name.
pub struct MockProvider {
    stream_responses: Arc<Mutex<Vec<Vec<String>>>>,
    transcriptions: Arc<Mutex<HashMap<String, ScriptedTranscription>>>,
    models: Vec<String>,
    connectors: Vec<String>,
    conversations: Arc<Mutex<Vec<Conversation>>>,
    transcribed: Arc<Mutex<Vec<String>>>,
    stream_calls: Arc<Mutex<usize>>,
    transcribe_calls: Arc<Mutex<usize>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            stream_responses: Arc::new(Mutex::new(Vec::new())),
            transcriptions: Arc::new(Mutex::new(HashMap::new())),
            models: Vec::new(),
            connectors: Vec::new(),
            conversations: Arc::new(Mutex::new(Vec::new())),
            transcribed: Arc::new(Mutex::new(Vec::new())),
            stream_calls: Arc::new(Mutex::new(0)),
            transcribe_calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Queue an answer streamed as `chunks`. Answers are replayed round-robin.
    pub fn with_stream_response<S: Into<String>>(self, chunks: impl IntoIterator<Item = S>) -> Self {
        lock(&self.stream_responses).push(chunks.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_transcription(
        self,
        file_name: &str,
        segments: Vec<AudioSegment>,
        delay: Duration,
    ) -> Self {
        lock(&self.transcriptions).insert(
            file_name.to_string(),
            ScriptedTranscription {
                segments,
                delay,
                failures: Vec::new(),
                fatal: None,
            },
        );
        self
    }

    /// Fail the next transcription of `file_name` once with `message`.
    pub fn with_transcription_failure_once(self, file_name: &str, message: &str) -> Self {
        lock(&self.transcriptions)
            .entry(file_name.to_string())
            .or_insert_with(|| ScriptedTranscription {
                segments: Vec::new(),
                delay: Duration::ZERO,
                failures: Vec::new(),
                fatal: None,
            })
            .failures
            .push(message.to_string());
        self
    }

    /// Fail every transcription of `file_name` with `message`.
    pub fn with_fatal_transcription(self, file_name: &str, message: &str) -> Self {
        lock(&self.transcriptions)
            .entry(file_name.to_string())
            .or_insert_with(|| ScriptedTranscription {
                segments: Vec::new(),
                delay: Duration::ZERO,
                failures: Vec::new(),
                fatal: None,
            })
            .fatal = Some(message.to_string());
        self
    }

    pub fn with_models(mut self, models: Vec<String>) -> Self {
        self.models = models;
        self
    }

    pub fn with_connectors(mut self, connectors: Vec<String>) -> Self {
        self.connectors = connectors;
        self
    }

    pub fn get_call_count(&self) -> usize {
        *lock(&self.stream_calls)
    }

    pub fn get_transcribe_call_count(&self) -> usize {
        *lock(&self.transcribe_calls)
    }

    /// Conversations passed to `stream`, in call order.
    pub fn recorded_conversations(&self) -> Vec<Conversation> {
        lock(&self.conversations).clone()
    }

    /// File names passed to `transcribe`, in call order.
    pub fn transcribed_files(&self) -> Vec<String> {
        lock(&self.transcribed).clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn stream(
        &self,
        _config: &GenerationConfig,
        conversation: &Conversation,
    ) -> Result<TextStream> {
        let count = {
            let mut count = lock(&self.stream_calls);
            *count += 1;
            *count
        };
        lock(&self.conversations).push(conversation.clone());

        let chunks = {
            let responses = lock(&self.stream_responses);
            if responses.is_empty() {
                let echo = conversation
                    .last()
                    .map(|message| message.text())
                    .unwrap_or_default();
                vec![format!("echo: {}", echo)]
            } else {
                responses[(count - 1) % responses.len()].clone()
            }
        };

        let chunks = chunks
            .into_iter()
            .map(|chunk| Ok::<_, io::Error>(Bytes::from(chunk)));
        Ok(Box::pin(StreamReader::new(futures::stream::iter(chunks))))
    }

    async fn transcribe(
        &self,
        _config: &GenerationConfig,
        mut audio: AudioFile,
    ) -> Result<Vec<AudioSegment>> {
        *lock(&self.transcribe_calls) += 1;
        let file_name = audio.file_name();
        lock(&self.transcribed).push(file_name.clone());

        let mut data = Vec::new();
        audio.reader.read_to_end(&mut data).await?;

        let scripted = {
            let mut transcriptions = lock(&self.transcriptions);
            match transcriptions.get_mut(&file_name) {
                Some(scripted) if !scripted.failures.is_empty() => {
                    return Err(Error::AiProvider(scripted.failures.remove(0)));
                }
                Some(scripted) => scripted.clone(),
                None => ScriptedTranscription {
                    segments: vec![AudioSegment {
                        text: format!("{} ({} bytes)", file_name, data.len()),
                        seek: 0,
                        start: 0.0,
                        end: 1.0,
                    }],
                    delay: Duration::ZERO,
                    failures: Vec::new(),
                    fatal: None,
                },
            }
        };

        if let Some(message) = scripted.fatal {
            return Err(Error::AiProvider(message));
        }
        if !scripted.delay.is_zero() {
            tokio::time::sleep(scripted.delay).await;
        }
        Ok(scripted.segments)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(self.models.clone())
    }

    async fn list_connectors(&self) -> Result<Vec<String>> {
        Ok(self.connectors.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    #[tokio::test]
    async fn test_stream_delivers_one_chunk_per_read() {
        let provider = MockProvider::new().with_stream_response(["h", "i"]);
        let conversation = Conversation::try_from(vec![Message::user("hello")]).unwrap();

        let mut stream = provider
            .stream(&GenerationConfig::default(), &conversation)
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 1);
        assert_eq!(&buf[..1], b"h");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 1);
        assert_eq!(&buf[..1], b"i");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);

        assert_eq!(provider.get_call_count(), 1);
        assert_eq!(provider.recorded_conversations(), vec![conversation]);
    }

    #[tokio::test]
    async fn test_failure_once_then_success() {
        let segment = AudioSegment {
            text: "A".to_string(),
            seek: 0,
            start: 0.0,
            end: 1.0,
        };
        let provider = MockProvider::new()
            .with_transcription("a.mp3", vec![segment.clone()], Duration::ZERO)
            .with_transcription_failure_once("a.mp3", "Please try again in 0m0.10s.");

        let config = GenerationConfig::default();
        let err = provider
            .transcribe(&config, AudioFile::from_bytes("a.mp3", vec![1]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Please try again"));

        let segments = provider
            .transcribe(&config, AudioFile::from_bytes("a.mp3", vec![1]))
            .await
            .unwrap();
        assert_eq!(segments, vec![segment]);
        assert_eq!(provider.get_transcribe_call_count(), 2);
    }
}
