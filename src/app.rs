//! Command-line orchestration: config edits, listings, attachments and turns.

use crate::ai::cache::DEFAULT_CACHE_PATH;
use crate::ai::mime::{data_url, detect_mime, AUDIO_MIME_PREFIX, IMAGE_MIME_PREFIX};
use crate::ai::{provider_from_env, CachedProvider, Provider};
use crate::config::Config;
use crate::exec::{BlockExecutor, ProcessExecutor};
use crate::models::{fold_context, AudioFile, Conversation, Message};
use crate::pipeline::Terminal;
use crate::runner::{Mode, TurnRunner};
use crate::transcribe::format_segments;
use crate::{Error, Result};
use bytes::Bytes;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Parser)]
#[command(name = "cmd")]
#[command(about = "Ask an LLM from the terminal and run the code it writes")]
pub struct CliArgs {
    /// Start chat session with LLM, other flags apply.
    #[arg(short, long)]
    pub interactive: bool,

    /// Execute generated command/code, do not show LLM output.
    #[arg(short, long, conflicts_with = "run")]
    pub execute: bool,

    /// Stream LLM output and run generated command/code at the end.
    #[arg(short, long)]
    pub run: bool,

    /// File to process: audio is transcribed, images are sent along with the prompt.
    #[arg(short, long, value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Show current config.
    #[arg(short = 'c', long = "config")]
    pub show_config: bool,

    /// List available models.
    #[arg(long)]
    pub list_models: bool,

    /// Set model to use.
    #[arg(long = "model", value_name = "ID")]
    pub set_model: Option<String>,

    /// List available connectors.
    #[arg(long)]
    pub list_connectors: bool,

    /// Set connectors to use.
    #[arg(long = "connector", value_name = "ID")]
    pub set_connectors: Vec<String>,

    /// Set temperature value.
    #[arg(short = 't', long = "temperature")]
    pub set_temperature: Option<f64>,

    /// Set top-p value.
    #[arg(short = 'p', long = "top-p")]
    pub set_top_p: Option<f64>,

    /// Set top-k value.
    #[arg(short = 'k', long = "top-k")]
    pub set_top_k: Option<u32>,

    /// Set frequency penalty value.
    #[arg(long = "freq")]
    pub set_frequency_penalty: Option<f64>,

    /// Set presence penalty value.
    #[arg(long = "pres")]
    pub set_presence_penalty: Option<f64>,

    /// Prompt, words are joined with spaces.
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}

/// What the process was handed besides its arguments.
#[derive(Default)]
pub struct Input {
    /// Everything read from stdin when it is a pipe.
    pub piped: Option<String>,
    /// Line source for interactive sessions, normally `/dev/tty`.
    pub tty: Option<Box<dyn AsyncBufRead + Unpin + Send>>,
}

const LINE_CHANNEL_CAPACITY: usize = 16;

/// Read lines from a blocking source on a dedicated thread.
///
/// The thread is detached, so a read that never completes (an idle
/// terminal after cancellation) does not hold up runtime shutdown.
pub fn line_source<R>(reader: R) -> Box<dyn AsyncBufRead + Unpin + Send>
where
    R: std::io::BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<std::io::Result<Bytes>>(LINE_CHANNEL_CAPACITY);

    std::thread::spawn(move || {
        let mut reader = reader;
        loop {
            let mut line = Vec::new();
            let item = match reader.read_until(b'\n', &mut line) {
                Ok(0) => return,
                Ok(_) => Ok(Bytes::from(line)),
                Err(e) => Err(e),
            };
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                return;
            }
        }
    });

    let lines = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Box::new(StreamReader::new(Box::pin(lines)))
}

pub struct App {
    config: Config,
    config_path: PathBuf,
    cache_path: PathBuf,
    terminal: Terminal,
    provider: Option<Arc<dyn Provider>>,
    executor: Arc<dyn BlockExecutor>,
}

impl App {
    /// Load the persisted config; the provider is resolved lazily from the
    /// environment when a command needs it.
    pub fn load(config_path: PathBuf) -> Result<Self> {
        let config = Config::load(&config_path)?;
        Ok(Self {
            config,
            config_path,
            cache_path: PathBuf::from(DEFAULT_CACHE_PATH),
            terminal: Terminal::stdout(),
            provider: None,
            executor: Arc::new(ProcessExecutor::new()),
        })
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_terminal(mut self, terminal: Terminal) -> Self {
        self.terminal = terminal;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn BlockExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_cache_path(mut self, cache_path: PathBuf) -> Self {
        self.cache_path = cache_path;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn run(
        &mut self,
        args: &CliArgs,
        input: Input,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if args.show_config {
            return self.print_config().await;
        }
        if args.list_models {
            return self.list_models().await;
        }
        if args.list_connectors {
            return self.list_connectors().await;
        }
        if self.apply_settings(args)? {
            self.config.save(&self.config_path)?;
            return self.print_config().await;
        }
        self.chat(args, input, cancel).await
    }

    /// Copy set-* flags into the config. Returns whether anything changed.
    pub fn apply_settings(&mut self, args: &CliArgs) -> Result<bool> {
        let mut dirty = false;

        if let Some(model) = &args.set_model {
            let capability = self.config.set_model(model)?;
            tracing::info!("Selected {} for {}", model, capability);
            dirty = true;
        }

        let generation = &mut self.config.generation;
        if !args.set_connectors.is_empty() {
            generation.connectors = args.set_connectors.clone();
            dirty = true;
        }
        if let Some(temperature) = args.set_temperature {
            generation.temperature = Some(temperature);
            dirty = true;
        }
        if let Some(top_p) = args.set_top_p {
            generation.top_p = Some(top_p);
            dirty = true;
        }
        if let Some(top_k) = args.set_top_k {
            generation.top_k = Some(top_k);
            dirty = true;
        }
        if let Some(penalty) = args.set_frequency_penalty {
            generation.frequency_penalty = Some(penalty);
            dirty = true;
        }
        if let Some(penalty) = args.set_presence_penalty {
            generation.presence_penalty = Some(penalty);
            dirty = true;
        }
        Ok(dirty)
    }

    async fn print_config(&self) -> Result<()> {
        let json = self.config.to_json()?;
        self.terminal
            .write_str(&format!("Current config:\n{}\n", json))
            .await?;
        Ok(())
    }

    async fn list_models(&self) -> Result<()> {
        let models = self.provider()?.list_models().await?;

        let mut out = String::from("Available models:\n");
        for model in models {
            out.push_str(&model);
            out.push('\n');
        }
        out.push('\n');
        for (capability, model) in &self.config.generation.model {
            out.push_str(&format!(
                "Currently selected model for {}: {}\n",
                capability, model
            ));
        }
        self.terminal.write_str(&out).await?;
        Ok(())
    }

    async fn list_connectors(&self) -> Result<()> {
        let connectors = self.provider()?.list_connectors().await?;

        let mut out = String::from("Available connectors:\n");
        for connector in connectors {
            out.push_str(&connector);
            out.push('\n');
        }
        out.push_str(&format!(
            "\nCurrently selected connectors: [{}]\n",
            self.config.generation.connectors.join(", ")
        ));
        self.terminal.write_str(&out).await?;
        Ok(())
    }

    fn provider(&self) -> Result<Arc<dyn Provider>> {
        match &self.provider {
            Some(provider) => Ok(provider.clone()),
            None => provider_from_env(self.config.provider),
        }
    }

    async fn chat(&self, args: &CliArgs, input: Input, cancel: &CancellationToken) -> Result<()> {
        let prompt = args.prompt.join(" ");
        let piped = input.piped.filter(|piped| !piped.is_empty());
        if prompt.is_empty() && piped.is_none() && !args.interactive && args.file.is_none() {
            return Err(Error::Generic("what's your command?".to_string()));
        }

        let provider = self.provider()?;
        if !self.config.record {
            return self.converse(provider, args, prompt, piped, input.tty, cancel).await;
        }

        let cache = Arc::new(CachedProvider::open(provider, &self.cache_path)?);
        let result = self
            .converse(cache.clone(), args, prompt, piped, input.tty, cancel)
            .await;
        let closed = cache.close();
        result.and(closed)
    }

    async fn converse(
        &self,
        provider: Arc<dyn Provider>,
        args: &CliArgs,
        prompt: String,
        piped: Option<String>,
        tty: Option<Box<dyn AsyncBufRead + Unpin + Send>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let context = piped.unwrap_or_default();
        let mut opening = if args.interactive {
            Message::user(context)
        } else {
            Message::user(fold_context(&context, &prompt))
        };

        if let Some(path) = &args.file {
            let data = tokio::fs::read(path).await.map_err(|e| {
                Error::Generic(format!("failed to read {}: {}", path.display(), e))
            })?;
            match detect_mime(&data) {
                Some(mime) if mime.starts_with(AUDIO_MIME_PREFIX) => {
                    let audio = AudioFile::from_bytes(path, data);
                    let segments = provider
                        .transcribe(&self.config.generation, audio)
                        .await?;
                    self.terminal.write_str(&format_segments(&segments)).await?;
                    return Ok(());
                }
                Some(mime) if mime.starts_with(IMAGE_MIME_PREFIX) => {
                    opening = Message::user_with_image(opening.text(), data_url(mime, &data));
                }
                _ => {
                    return Err(Error::Generic(format!(
                        "unsupported file type: {}",
                        path.display()
                    )))
                }
            }
        }

        let runner = TurnRunner::new(
            provider,
            self.config.generation.clone(),
            Mode::from_flags(args.execute, args.run),
            self.terminal.clone(),
            self.executor.clone(),
        );

        if args.interactive {
            let tty = tty.ok_or_else(|| {
                Error::Generic("interactive mode needs a terminal".to_string())
            })?;
            runner
                .multi_turn(tty, Some(opening), Some(prompt), cancel)
                .await?;
            return Ok(());
        }

        let conversation = Conversation::try_from(vec![opening])?;
        runner.run_turn(&conversation, cancel).await?;
        Ok(())
    }
}
