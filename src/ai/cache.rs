//! Content-addressed transcription cache.
//!
//! [`CachedProvider`] answers repeated transcriptions of the same audio bytes
//! from an on-disk index, regardless of file name. Chat streams and listings
//! pass straight through.

use super::{Provider, TextStream};
use crate::config::GenerationConfig;
use crate::models::{AudioFile, AudioSegment, Conversation};
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncReadExt;

pub const DEFAULT_CACHE_PATH: &str = ".cache/cache.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheIndex {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub audio_segments: BTreeMap<String, Vec<AudioSegment>>,
}

impl CacheIndex {
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No cache at {}, starting empty", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// URL-safe base64 (padded) of the SHA-256 digest of `data`.
pub fn cache_key(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE.encode(Sha256::digest(data))
}

pub struct CachedProvider {
    inner: Arc<dyn Provider>,
    index: Mutex<CacheIndex>,
    path: PathBuf,
}

impl CachedProvider {
    pub fn open(inner: Arc<dyn Provider>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let index = CacheIndex::load(&path)?;
        tracing::info!(
            "Loaded {} cached transcriptions from {}",
            index.audio_segments.len(),
            path.display()
        );
        Ok(Self {
            inner,
            index: Mutex::new(index),
            path,
        })
    }

    fn lookup(&self, key: &str) -> Option<Vec<AudioSegment>> {
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .audio_segments
            .get(key)
            .cloned()
    }

    fn store(&self, key: String, segments: Vec<AudioSegment>) {
        self.index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .audio_segments
            .insert(key, segments);
    }

    /// Write the index to disk. Safe to call more than once.
    pub fn close(&self) -> Result<()> {
        let index = self
            .index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        index.save(&self.path)?;
        tracing::info!(
            "Saved {} cached transcriptions to {}",
            index.audio_segments.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[async_trait]
impl Provider for CachedProvider {
    async fn stream(
        &self,
        config: &GenerationConfig,
        conversation: &Conversation,
    ) -> Result<TextStream> {
        self.inner.stream(config, conversation).await
    }

    async fn transcribe(
        &self,
        config: &GenerationConfig,
        mut audio: AudioFile,
    ) -> Result<Vec<AudioSegment>> {
        let mut data = Vec::new();
        audio.reader.read_to_end(&mut data).await?;
        let key = cache_key(&data);

        if let Some(segments) = self.lookup(&key) {
            tracing::debug!("Cache hit for {}", audio.path.display());
            return Ok(segments);
        }

        tracing::debug!("Cache miss for {}", audio.path.display());
        let audio = AudioFile::from_bytes(audio.path, data);
        let segments = self.inner.transcribe(config, audio).await?;
        self.store(key, segments.clone());
        Ok(segments)
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        self.inner.list_models().await
    }

    async fn list_connectors(&self) -> Result<Vec<String>> {
        self.inner.list_connectors().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockProvider;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn segment(text: &str) -> AudioSegment {
        AudioSegment {
            text: text.to_string(),
            seek: 0,
            start: 0.0,
            end: 2.0,
        }
    }

    #[test]
    fn test_cache_key_is_url_safe_padded_sha256() {
        assert_eq!(
            cache_key(b""),
            "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU="
        );
    }

    #[tokio::test]
    async fn test_repeat_transcription_hits_cache_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/cache.json");
        let mock = Arc::new(
            MockProvider::new().with_transcription("a.mp3", vec![segment("A")], Default::default()),
        );
        let config = GenerationConfig::default();

        let cached = CachedProvider::open(mock.clone(), &path).unwrap();
        let first = cached
            .transcribe(&config, AudioFile::from_bytes("a.mp3", b"same".to_vec()))
            .await
            .unwrap();
        let second = cached
            .transcribe(&config, AudioFile::from_bytes("a.mp3", b"same".to_vec()))
            .await
            .unwrap();
        assert_eq!(first, vec![segment("A")]);
        assert_eq!(second, first);
        assert_eq!(mock.get_transcribe_call_count(), 1);

        cached.close().unwrap();
        assert!(path.exists());

        let reopened = CachedProvider::open(mock.clone(), &path).unwrap();
        let third = reopened
            .transcribe(&config, AudioFile::from_bytes("a.mp3", b"same".to_vec()))
            .await
            .unwrap();
        assert_eq!(third, first);
        assert_eq!(mock.get_transcribe_call_count(), 1);
    }

    #[tokio::test]
    async fn test_identical_bytes_share_an_entry() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(
            MockProvider::new().with_transcription("a.mp3", vec![segment("A")], Default::default()),
        );
        let config = GenerationConfig::default();
        let cached = CachedProvider::open(mock.clone(), dir.path().join("cache.json")).unwrap();

        let a = cached
            .transcribe(&config, AudioFile::from_bytes("a.mp3", b"bytes".to_vec()))
            .await
            .unwrap();
        let b = cached
            .transcribe(&config, AudioFile::from_bytes("copy-of-a.mp3", b"bytes".to_vec()))
            .await
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(mock.transcribed_files(), vec!["a.mp3"]);
    }

    #[tokio::test]
    async fn test_miss_forwards_buffered_bytes() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockProvider::new());
        let cached = CachedProvider::open(mock.clone(), dir.path().join("cache.json")).unwrap();

        let segments = cached
            .transcribe(
                &GenerationConfig::default(),
                AudioFile::from_bytes("b.mp3", vec![0u8; 42]),
            )
            .await
            .unwrap();

        assert_eq!(segments[0].text, "b.mp3 (42 bytes)");
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let dir = tempdir().unwrap();
        let mock = Arc::new(MockProvider::new().with_transcription_failure_once("a.mp3", "boom"));
        let config = GenerationConfig::default();
        let cached = CachedProvider::open(mock.clone(), dir.path().join("cache.json")).unwrap();

        assert!(cached
            .transcribe(&config, AudioFile::from_bytes("a.mp3", vec![1]))
            .await
            .is_err());
        assert!(cached
            .transcribe(&config, AudioFile::from_bytes("a.mp3", vec![1]))
            .await
            .is_ok());
        assert_eq!(mock.get_transcribe_call_count(), 2);
    }

    #[test]
    fn test_file_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let mut index = CacheIndex::default();
        index
            .audio_segments
            .insert("k".to_string(), vec![segment("A")]);
        index.save(&path).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["audio_segments"]["k"][0]["text"], "A");
        assert_eq!(CacheIndex::load(&path).unwrap(), index);
    }

    #[test]
    fn test_malformed_cache_fails_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();

        let result = CachedProvider::open(Arc::new(MockProvider::new()), &path);
        assert!(matches!(result, Err(Error::Serialization(_))));
    }
}
