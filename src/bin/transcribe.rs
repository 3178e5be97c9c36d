//! Batch transcription of every `*.mp3` in a directory.
//!
//! Results are cached under `.cache/cache.json` by content, so an interrupted
//! run picks up where it stopped. Ctrl-C flushes the cache before exiting.

use anyhow::{Context, Result};
use clap::Parser;
use cmd_cli::ai::cache::DEFAULT_CACHE_PATH;
use cmd_cli::ai::{provider_from_env, CachedProvider};
use cmd_cli::config::{GenerationConfig, ProviderKind};
use cmd_cli::transcribe::{format_segments, TranscriptionPool, DEFAULT_CONCURRENCY};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "transcribe")]
#[command(about = "Transcribe every mp3 file in a directory")]
struct CliArgs {
    /// Directory containing the mp3 files.
    #[arg(value_name = "DIR")]
    directory: PathBuf,

    /// Number of files transcribed at once.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Transcription cache file.
    #[arg(long, default_value = DEFAULT_CACHE_PATH)]
    cache: PathBuf,
}

fn mp3_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "mp3") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cmd_cli=info,transcribe=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = CliArgs::parse();

    if let Err(e) = run(args).await {
        error!("Transcription failed: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: CliArgs) -> Result<()> {
    let files = mp3_files(&args.directory)?;
    info!("Found {} files in {}", files.len(), args.directory.display());

    let provider = provider_from_env(ProviderKind::Groq)?;
    let cache = Arc::new(
        CachedProvider::open(provider, &args.cache)
            .with_context(|| format!("failed to open cache {}", args.cache.display()))?,
    );

    tokio::spawn({
        let cache = cache.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, flushing cache");
                if let Err(e) = cache.close() {
                    error!("Failed to flush cache: {}", e);
                }
                std::process::exit(1);
            }
        }
    });

    let pool = TranscriptionPool::new(cache.clone(), GenerationConfig::default())
        .with_concurrency(args.concurrency);
    let transcripts = pool.transcribe_all(files).await;
    cache.close().context("failed to write cache")?;

    for (index, segments) in transcripts?.iter().enumerate() {
        print!("File {}:\n{}", index, format_segments(segments));
    }
    Ok(())
}
