use super::client::OpenAiHttpClient;
use super::types::TranscriptionResponse;
use super::DEFAULT_AUDIO_MODEL;
use crate::config::{Capability, GenerationConfig};
use crate::models::{AudioFile, AudioSegment};
use crate::Result;
use reqwest::multipart::{Form, Part};
use tokio::io::AsyncReadExt;

pub(crate) async fn transcribe(
    http: &OpenAiHttpClient,
    config: &GenerationConfig,
    mut audio: AudioFile,
) -> Result<Vec<AudioSegment>> {
    let model = config.model_or(Capability::SpeechToText, DEFAULT_AUDIO_MODEL);
    let file_name = audio.file_name();

    let mut data = Vec::new();
    audio.reader.read_to_end(&mut data).await?;
    tracing::debug!(
        "Transcribing {} ({} bytes) with {}",
        file_name,
        data.len(),
        model
    );

    let form = Form::new()
        .part("file", Part::bytes(data).file_name(file_name))
        .text("model", model.to_string())
        .text("response_format", "verbose_json");

    let response: TranscriptionResponse = http.post_multipart("/audio/transcriptions", form).await?;

    Ok(response
        .segments
        .into_iter()
        .map(|segment| AudioSegment {
            text: segment.text,
            seek: segment.seek,
            start: segment.start,
            end: segment.end,
        })
        .collect())
}
