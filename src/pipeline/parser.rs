//! Fenced code block extraction from a streamed answer.
//!
//! Bytes written to a [`BlockWriter`] are handed to a parser task which scans
//! them line by line and emits each [`CodeBlock`] as soon as its closing fence
//! arrives. Closing the writer ends the block sequence.

use super::sink::Sink;
use async_trait::async_trait;
use std::io;
use tokio::sync::mpsc;

const FENCE: &str = "```";
const BYTE_CHANNEL_CAPACITY: usize = 64;
const BLOCK_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Shell,
    Html,
    Css,
    JavaScript,
    Go,
    Python,
    Unknown,
}

impl Language {
    /// Map the info string after an opening fence to a language.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "bash" | "sh" | "shell" => Language::Shell,
            "html" => Language::Html,
            "css" => Language::Css,
            "javascript" | "js" => Language::JavaScript,
            "go" | "golang" => Language::Go,
            "python" | "python3" | "py" => Language::Python,
            _ => Language::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: Language,
    /// Block body with fence lines stripped; every line ends with `\n`.
    pub code: String,
}

/// Incremental line scanner. Partial lines are carried across `feed` calls.
#[derive(Debug, Default)]
pub struct Scanner {
    pending: Vec<u8>,
    open: Option<CodeBlock>,
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume `bytes`, returning every block closed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<CodeBlock> {
        self.pending.extend_from_slice(bytes);

        let mut blocks = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            if let Some(block) = self.scan_line(&line[..pos]) {
                blocks.push(block);
            }
        }
        blocks
    }

    /// Signal end of input. The unterminated tail is scanned as a final line;
    /// a block still open afterwards is discarded.
    pub fn finish(mut self) -> Option<CodeBlock> {
        let tail = std::mem::take(&mut self.pending);
        if tail.is_empty() {
            return None;
        }
        self.scan_line(&tail)
    }

    fn scan_line(&mut self, raw: &[u8]) -> Option<CodeBlock> {
        let line = String::from_utf8_lossy(raw);
        let line = line.strip_suffix('\r').unwrap_or(&line);

        if self.open.is_some() {
            if line == FENCE {
                return self.open.take();
            }
            if let Some(block) = self.open.as_mut() {
                block.code.push_str(line);
                block.code.push('\n');
            }
        } else if let Some(tag) = line.strip_prefix(FENCE) {
            self.open = Some(CodeBlock {
                language: Language::from_tag(tag),
                code: String::new(),
            });
        }
        None
    }
}

/// Write side of the parser; each write is copied into the parser's channel.
pub struct BlockWriter {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

#[async_trait]
impl Sink for BlockWriter {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "block parser is closed"))?;
        // The caller may reuse `buf` once we return, so the channel gets its own copy.
        tx.send(buf.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "block parser stopped"))?;
        Ok(buf.len())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.tx.take();
        Ok(())
    }
}

/// Start a parser task.
///
/// The returned receiver must be drained concurrently with writes, and the
/// writer must be closed (or dropped) for the receiver to end.
pub fn spawn_parser() -> (BlockWriter, mpsc::Receiver<CodeBlock>) {
    let (byte_tx, mut byte_rx) = mpsc::channel::<Vec<u8>>(BYTE_CHANNEL_CAPACITY);
    let (block_tx, block_rx) = mpsc::channel(BLOCK_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut scanner = Scanner::new();
        while let Some(chunk) = byte_rx.recv().await {
            for block in scanner.feed(&chunk) {
                tracing::debug!("Parsed {:?} block ({} bytes)", block.language, block.code.len());
                if block_tx.send(block).await.is_err() {
                    tracing::debug!("Block consumer dropped, stopping parser");
                    return;
                }
            }
        }
        if let Some(block) = scanner.finish() {
            let _ = block_tx.send(block).await;
        }
    });

    (
        BlockWriter {
            tx: Some(byte_tx),
        },
        block_rx,
    )
}
