//! One chat turn, and the interactive loop built from turns.
//!
//! A turn streams the provider's answer into a [`FanOut`] whose shape
//! depends on the [`Mode`]:
//!
//! | mode                   | sinks                              | blocks                      |
//! |------------------------|------------------------------------|-----------------------------|
//! | `Display`              | terminal, capture                  | ignored                     |
//! | `ExecuteSilently`      | parser, capture                    | run as soon as they close   |
//! | `DisplayThenExecute`   | parser, terminal, capture          | run in order after the turn |

use crate::ai::Provider;
use crate::config::GenerationConfig;
use crate::exec::BlockExecutor;
use crate::models::{Conversation, Message};
use crate::pipeline::{spawn_parser, CaptureBuffer, CodeBlock, FanOut, Sink, Terminal};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const COPY_BUFFER_SIZE: usize = 8 * 1024;
const USER_PROMPT: &str = "User> ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Display,
    ExecuteSilently,
    DisplayThenExecute,
}

impl Mode {
    pub fn from_flags(execute: bool, run: bool) -> Self {
        match (execute, run) {
            (true, _) => Mode::ExecuteSilently,
            (false, true) => Mode::DisplayThenExecute,
            (false, false) => Mode::Display,
        }
    }
}

type BlockConsumer = JoinHandle<Result<Vec<CodeBlock>>>;

pub struct TurnRunner {
    provider: Arc<dyn Provider>,
    config: GenerationConfig,
    mode: Mode,
    terminal: Terminal,
    executor: Arc<dyn BlockExecutor>,
}

impl TurnRunner {
    pub fn new(
        provider: Arc<dyn Provider>,
        config: GenerationConfig,
        mode: Mode,
        terminal: Terminal,
        executor: Arc<dyn BlockExecutor>,
    ) -> Self {
        Self {
            provider,
            config,
            mode,
            terminal,
            executor,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Answer the last message of `conversation`, returning the full
    /// assistant text for the caller to append.
    pub async fn run_turn(
        &self,
        conversation: &Conversation,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let capture = CaptureBuffer::new();

        // The block consumer has to be running before the first write reaches the parser.
        let (sinks, consumer) = self.topology(&capture);
        let mut fan_out = FanOut::new(sinks);

        let copied = self.pump(conversation, &mut fan_out, cancel).await;
        let newline = match self.mode {
            Mode::ExecuteSilently => Ok(()),
            Mode::Display | Mode::DisplayThenExecute => self.terminal.write_str("\n").await,
        };
        let closed = fan_out.close().await;
        let consumed = match consumer {
            Some(handle) => handle
                .await
                .map_err(|e| Error::Generic(format!("block consumer failed: {}", e)))?,
            None => Ok(Vec::new()),
        };

        copied?;
        newline?;
        closed?;
        let blocks = consumed?;

        for block in &blocks {
            tracing::debug!("Executing {:?} block", block.language);
            self.executor.execute(block).await?;
        }

        Ok(capture.to_string_lossy())
    }

    fn topology(&self, capture: &CaptureBuffer) -> (Vec<Box<dyn Sink>>, Option<BlockConsumer>) {
        let capture: Box<dyn Sink> = Box::new(capture.clone());
        match self.mode {
            Mode::Display => (vec![Box::new(self.terminal.clone()), capture], None),
            Mode::ExecuteSilently => {
                let (writer, blocks) = spawn_parser();
                let consumer = tokio::spawn(execute_eagerly(self.executor.clone(), blocks));
                (vec![Box::new(writer), capture], Some(consumer))
            }
            Mode::DisplayThenExecute => {
                let (writer, blocks) = spawn_parser();
                let consumer = tokio::spawn(collect(blocks));
                (
                    vec![Box::new(writer), Box::new(self.terminal.clone()), capture],
                    Some(consumer),
                )
            }
        }
    }

    /// Copy the provider stream into `fan_out` until it ends or `cancel` fires.
    async fn pump(
        &self,
        conversation: &Conversation,
        fan_out: &mut FanOut,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            stream = self.provider.stream(&self.config, conversation) => stream?,
        };

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut total = 0;
        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                read = stream.read(&mut buf) => read.map_err(Error::from_stream)?,
            };
            if n == 0 {
                tracing::debug!("Stream finished after {} bytes", total);
                return Ok(());
            }
            fan_out.write(&buf[..n]).await?;
            total += n;
        }
    }

    /// Interactive session. `opening` carries piped context or an image and
    /// absorbs the first line; `prompt`, when non-empty, is that first line.
    /// Ends cleanly when `input` closes or `cancel` fires.
    pub async fn multi_turn<R>(
        &self,
        input: R,
        opening: Option<Message>,
        prompt: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Conversation>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut conversation = Conversation::new();
        let mut opening = opening;
        let mut pending = prompt.filter(|prompt| !prompt.is_empty());

        loop {
            if cancel.is_cancelled() {
                return Ok(conversation);
            }

            let line = match pending.take() {
                Some(line) => line,
                None => {
                    self.terminal.write_str(USER_PROMPT).await?;
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return Ok(conversation),
                        next = lines.next_line() => next?,
                    };
                    match next {
                        Some(line) => line,
                        None => return Ok(conversation),
                    }
                }
            };

            let message = match opening.take() {
                Some(mut message) => {
                    message.splice_prompt(&line);
                    message
                }
                None => Message::user(line),
            };
            conversation.push(message)?;

            match self.run_turn(&conversation, cancel).await {
                Ok(answer) => conversation.push(Message::assistant(answer))?,
                Err(Error::Cancelled) => return Ok(conversation),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Run blocks as they close. After the first failure the rest are drained
/// without running, and that failure is returned once the parser ends.
async fn execute_eagerly(
    executor: Arc<dyn BlockExecutor>,
    mut blocks: mpsc::Receiver<CodeBlock>,
) -> Result<Vec<CodeBlock>> {
    let mut failure = None;
    while let Some(block) = blocks.recv().await {
        if failure.is_some() {
            tracing::debug!("Skipping {:?} block after earlier failure", block.language);
            continue;
        }
        if let Err(e) = executor.execute(&block).await {
            tracing::warn!("Block execution failed: {}", e);
            failure = Some(e);
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(Vec::new()),
    }
}

async fn collect(mut blocks: mpsc::Receiver<CodeBlock>) -> Result<Vec<CodeBlock>> {
    let mut collected = Vec::new();
    while let Some(block) = blocks.recv().await {
        collected.push(block);
    }
    Ok(collected)
}
