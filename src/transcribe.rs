//! Batch transcription over a bounded pool of workers.
//!
//! A producer queues `(index, path)` items, K workers transcribe them and
//! report `(index, segments)`, and the collector slots each result back at
//! its input position. Rate-limited requests are retried after the delay
//! the service asks for; any other failure aborts the whole batch.

use crate::ai::Provider;
use crate::config::GenerationConfig;
use crate::models::{AudioFile, AudioSegment};
use crate::{Error, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;

pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(60);

fn retry_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"Please try again in (\d+)m(\d+\.\d+)s\.").ok())
        .as_ref()
}

/// Parse the wait out of a "Please try again in 6m6.125s." message.
pub fn retry_after(message: &str) -> Option<Duration> {
    let captures = retry_pattern()?.captures(message)?;
    let minutes: u64 = captures.get(1)?.as_str().parse().ok()?;
    let seconds: f64 = captures.get(2)?.as_str().parse().ok()?;
    let millis = (seconds * 1000.0).round() as u64;
    Duration::from_secs(minutes.checked_mul(60)?).checked_add(Duration::from_millis(millis))
}

/// How long to back off before retrying after `err`, or `None` when the
/// error is not a rate limit.
pub fn retry_wait(err: &Error, default_wait: Duration) -> Option<Duration> {
    let message = err.to_string();
    if let Some(wait) = retry_after(&message) {
        return Some(wait);
    }
    // A wait that does not fit in a Duration still marks a rate limit.
    let rate_limited = matches!(err, Error::RateLimited(_))
        || retry_pattern().is_some_and(|pattern| pattern.is_match(&message));
    rate_limited.then_some(default_wait)
}

/// `<start> - <end>` then the text, for every segment.
pub fn format_segments(segments: &[AudioSegment]) -> String {
    segments
        .iter()
        .map(|segment| format!("{} - {}\n{}\n", segment.start, segment.end, segment.text))
        .collect()
}

type WorkItem = (usize, PathBuf);

pub struct TranscriptionPool {
    provider: Arc<dyn Provider>,
    config: GenerationConfig,
    concurrency: usize,
    default_wait: Duration,
}

impl TranscriptionPool {
    pub fn new(provider: Arc<dyn Provider>, config: GenerationConfig) -> Self {
        Self {
            provider,
            config,
            concurrency: DEFAULT_CONCURRENCY,
            default_wait: DEFAULT_RETRY_WAIT,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Wait used when a rate-limit reply carries no retry hint.
    pub fn with_default_wait(mut self, wait: Duration) -> Self {
        self.default_wait = wait;
        self
    }

    /// Transcribe every file; `output[i]` belongs to `files[i]`.
    pub async fn transcribe_all(&self, files: Vec<PathBuf>) -> Result<Vec<Vec<AudioSegment>>> {
        let total = files.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        tracing::info!(
            "Transcribing {} files with {} workers",
            total,
            self.concurrency
        );

        let (work_tx, work_rx) = mpsc::channel::<WorkItem>(self.concurrency);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::channel(self.concurrency);

        let mut tasks = JoinSet::new();
        tasks.spawn(async move {
            for item in files.into_iter().enumerate() {
                if work_tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        for worker in 0..self.concurrency {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let provider = self.provider.clone();
            let config = self.config.clone();
            let default_wait = self.default_wait;

            tasks.spawn(async move {
                loop {
                    let item = work_rx.lock().await.recv().await;
                    let Some((index, path)) = item else {
                        break;
                    };
                    tracing::debug!("Worker {} picked up {}", worker, path.display());

                    let outcome = transcribe_one(provider.as_ref(), &config, &path, default_wait)
                        .await
                        .map(|segments| (index, segments));
                    let failed = outcome.is_err();
                    if result_tx.send(outcome).await.is_err() || failed {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut transcripts: Vec<Option<Vec<AudioSegment>>> = vec![None; total];
        let mut received = 0;
        while received < total {
            match result_rx.recv().await {
                Some(Ok((index, segments))) => {
                    transcripts[index] = Some(segments);
                    received += 1;
                }
                Some(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                None => break,
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    return Err(Error::Generic(format!("transcription worker panicked: {}", e)));
                }
            }
        }

        transcripts
            .into_iter()
            .enumerate()
            .map(|(index, transcript)| {
                transcript.ok_or_else(|| Error::Generic(format!("no transcript for input {}", index)))
            })
            .collect()
    }
}

async fn transcribe_one(
    provider: &dyn Provider,
    config: &GenerationConfig,
    path: &Path,
    default_wait: Duration,
) -> Result<Vec<AudioSegment>> {
    let data = tokio::fs::read(path).await?;
    loop {
        tracing::info!("Transcribing {}", path.display());
        let audio = AudioFile::from_bytes(path, data.clone());
        match provider.transcribe(config, audio).await {
            Ok(segments) => return Ok(segments),
            Err(e) => match retry_wait(&e, default_wait) {
                Some(wait) => {
                    tracing::warn!("Rate limited on {}, waiting {:?}", path.display(), wait);
                    tokio::time::sleep(wait).await;
                }
                None => {
                    tracing::error!("Failed to transcribe {}: {}", path.display(), e);
                    return Err(e);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockProvider;
    use pretty_assertions::assert_eq;
    use std::time::Instant;
    use tempfile::{tempdir, TempDir};

    fn segment(text: &str) -> AudioSegment {
        AudioSegment {
            text: text.to_string(),
            seek: 0,
            start: 0.0,
            end: 1.5,
        }
    }

    fn audio_files(names: &[&str]) -> (TempDir, Vec<PathBuf>) {
        let dir = tempdir().unwrap();
        let paths = names
            .iter()
            .map(|name| {
                let path = dir.path().join(name);
                std::fs::write(&path, name.as_bytes()).unwrap();
                path
            })
            .collect();
        (dir, paths)
    }

    #[test]
    fn test_retry_after() {
        assert_eq!(
            retry_after("Rate limit reached. Please try again in 6m6.125s. Visit ..."),
            Some(Duration::from_secs(366) + Duration::from_millis(125))
        );
        assert_eq!(
            retry_after("Please try again in 0m0.10s."),
            Some(Duration::from_millis(100))
        );
        assert_eq!(retry_after("Please try again later."), None);
    }

    #[test]
    fn test_retry_wait_classification() {
        let default = Duration::from_secs(60);
        assert_eq!(
            retry_wait(&Error::RateLimited("slow down".to_string()), default),
            Some(default)
        );
        assert_eq!(
            retry_wait(
                &Error::AiProvider("Please try again in 0m2.50s.".to_string()),
                default
            ),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(
            retry_wait(&Error::AiProvider("bad audio".to_string()), default),
            None
        );
    }

    #[test]
    fn test_oversized_wait_falls_back_to_default() {
        let message = "Please try again in 999999999999999999m0.1s.";
        assert_eq!(retry_after(message), None);

        let default = Duration::from_secs(60);
        assert_eq!(
            retry_wait(&Error::AiProvider(message.to_string()), default),
            Some(default)
        );
    }

    #[test]
    fn test_format_segments() {
        let segments = vec![
            AudioSegment {
                text: "Hello".to_string(),
                seek: 0,
                start: 0.0,
                end: 1.5,
            },
            AudioSegment {
                text: "World".to_string(),
                seek: 0,
                start: 1.5,
                end: 3.0,
            },
        ];
        assert_eq!(format_segments(&segments), "0 - 1.5\nHello\n1.5 - 3\nWorld\n");
    }

    #[tokio::test]
    async fn test_output_follows_input_order() {
        let (_dir, files) = audio_files(&["a.mp3", "b.mp3", "c.mp3"]);
        let provider = MockProvider::new()
            .with_transcription("a.mp3", vec![segment("A")], Duration::from_millis(300))
            .with_transcription("b.mp3", vec![segment("B")], Duration::from_millis(10))
            .with_transcription("c.mp3", vec![segment("C")], Duration::from_millis(100));

        let pool = TranscriptionPool::new(Arc::new(provider), GenerationConfig::default())
            .with_concurrency(2);
        let transcripts = pool.transcribe_all(files).await.unwrap();

        assert_eq!(
            transcripts,
            vec![vec![segment("A")], vec![segment("B")], vec![segment("C")]]
        );
    }

    #[tokio::test]
    async fn test_rate_limited_item_is_retried_after_hint() {
        let (_dir, files) = audio_files(&["a.mp3"]);
        let provider = Arc::new(
            MockProvider::new()
                .with_transcription("a.mp3", vec![segment("A")], Duration::ZERO)
                .with_transcription_failure_once(
                    "a.mp3",
                    "Rate limit reached. Please try again in 0m0.10s.",
                ),
        );

        let pool = TranscriptionPool::new(provider.clone(), GenerationConfig::default());
        let started = Instant::now();
        let transcripts = pool.transcribe_all(files).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(transcripts, vec![vec![segment("A")]]);
        assert_eq!(provider.get_transcribe_call_count(), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_aborts_batch() {
        let (_dir, files) = audio_files(&["a.mp3", "b.mp3", "c.mp3"]);
        let provider = MockProvider::new()
            .with_transcription("a.mp3", vec![segment("A")], Duration::ZERO)
            .with_fatal_transcription("b.mp3", "file is not valid audio")
            .with_transcription("c.mp3", vec![segment("C")], Duration::ZERO);

        let pool = TranscriptionPool::new(Arc::new(provider), GenerationConfig::default());
        let err = pool.transcribe_all(files).await.unwrap_err();

        assert!(err.to_string().contains("file is not valid audio"));
    }

    #[tokio::test]
    async fn test_missing_file_is_fatal() {
        let dir = tempdir().unwrap();
        let pool = TranscriptionPool::new(Arc::new(MockProvider::new()), GenerationConfig::default());

        let err = pool
            .transcribe_all(vec![dir.path().join("missing.mp3")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let pool = TranscriptionPool::new(Arc::new(MockProvider::new()), GenerationConfig::default());
        assert!(pool.transcribe_all(Vec::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_more_workers_than_files() {
        let (_dir, files) = audio_files(&["only.mp3"]);
        let pool = TranscriptionPool::new(Arc::new(MockProvider::new()), GenerationConfig::default())
            .with_concurrency(8);

        let transcripts = pool.transcribe_all(files).await.unwrap();
        assert_eq!(transcripts.len(), 1);
        assert_eq!(transcripts[0][0].text, "only.mp3 (8 bytes)");
    }
}
