//! Local execution of extracted code blocks.
//!
//! Shell blocks run through `bash -c`. Other languages are written into a
//! scratch directory first: Go and Python are then run with their
//! toolchain, HTML is opened with the OS opener, and CSS/JavaScript are only
//! written since an HTML page next to them loads them.

use crate::pipeline::{CodeBlock, Language, Sink, Terminal};
use crate::{Error, Result};
use async_trait::async_trait;
use crossterm::style::{Color, ResetColor, SetForegroundColor};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

const GO_PREAMBLE: &str = "package main\n\n";

#[cfg(target_os = "macos")]
const OPENER: &str = "open";
#[cfg(not(target_os = "macos"))]
const OPENER: &str = "xdg-open";

#[async_trait]
pub trait BlockExecutor: Send + Sync {
    async fn execute(&self, block: &CodeBlock) -> Result<()>;
}

/// What running a block amounts to: an optional file to write, then an
/// optional program to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub file: Option<(PathBuf, String)>,
    pub program: Option<(String, Vec<String>)>,
}

impl Invocation {
    fn none() -> Self {
        Self {
            file: None,
            program: None,
        }
    }
}

pub struct ProcessExecutor {
    temp_dir: PathBuf,
    stdout: Option<Terminal>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::with_temp_dir(std::env::temp_dir())
    }

    pub fn with_temp_dir(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            stdout: None,
        }
    }

    /// Forward child stdout into `terminal` instead of inheriting it.
    pub fn with_stdout(mut self, terminal: Terminal) -> Self {
        self.stdout = Some(terminal);
        self
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn plan(&self, block: &CodeBlock) -> Invocation {
        let path_arg = |path: &Path| path.to_string_lossy().into_owned();

        match block.language {
            Language::Shell => Invocation {
                file: None,
                program: Some((
                    "bash".to_string(),
                    vec!["-c".to_string(), block.code.clone()],
                )),
            },
            Language::Html => {
                let path = self.temp_dir.join("index.html");
                let url = format!("file://{}", path_arg(&path));
                Invocation {
                    file: Some((path, block.code.clone())),
                    program: Some((OPENER.to_string(), vec![url])),
                }
            }
            Language::Css => Invocation {
                file: Some((self.temp_dir.join("style.css"), block.code.clone())),
                program: None,
            },
            Language::JavaScript => Invocation {
                file: Some((self.temp_dir.join("script.js"), block.code.clone())),
                program: None,
            },
            Language::Go => {
                let path = self.temp_dir.join("main.go");
                let code = if block.code.trim_start().starts_with("package") {
                    block.code.clone()
                } else {
                    format!("{}{}", GO_PREAMBLE, block.code)
                };
                Invocation {
                    program: Some((
                        "go".to_string(),
                        vec!["run".to_string(), path_arg(&path)],
                    )),
                    file: Some((path, code)),
                }
            }
            Language::Python => {
                let path = self.temp_dir.join("main.py");
                Invocation {
                    program: Some(("python3".to_string(), vec![path_arg(&path)])),
                    file: Some((path, block.code.clone())),
                }
            }
            Language::Unknown => Invocation::none(),
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<()> {
        tracing::debug!("Running {} with {} args", program, args.len());

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(if self.stdout.is_some() {
                Stdio::piped()
            } else {
                Stdio::inherit()
            })
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Generic(format!("failed to start {}: {}", program, e)))?;

        let stderr = child.stderr.take();
        let stdout = child.stdout.take().zip(self.stdout.clone());

        let stderr_task = async {
            match stderr {
                Some(stderr) => forward_stderr(stderr).await,
                None => Ok(()),
            }
        };
        let stdout_task = async {
            match stdout {
                Some((stdout, terminal)) => forward_stdout(stdout, terminal).await,
                None => Ok(()),
            }
        };

        let (status, stderr_result, stdout_result) =
            tokio::join!(child.wait(), stderr_task, stdout_task);
        stderr_result?;
        stdout_result?;

        let status = status?;
        if !status.success() {
            tracing::debug!("{} failed: {}", program, status);
            return Err(Error::Execution {
                program: program.to_string(),
                code: status.code(),
            });
        }
        Ok(())
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Child stderr is shown in red.
async fn forward_stderr(mut stderr: impl AsyncRead + Unpin) -> std::io::Result<()> {
    let mut out = tokio::io::stderr();
    let mut buf = [0u8; 4096];
    loop {
        let n = stderr.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        out.write_all(&paint_red(&buf[..n])?).await?;
        out.flush().await?;
    }
}

/// Wrap raw bytes in colour escapes. The bytes are not decoded, so a
/// character split across two reads survives intact.
fn paint_red(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut painted = Vec::with_capacity(bytes.len() + 16);
    crossterm::queue!(painted, SetForegroundColor(Color::Red))?;
    painted.extend_from_slice(bytes);
    crossterm::queue!(painted, ResetColor)?;
    Ok(painted)
}

async fn forward_stdout(
    mut stdout: impl AsyncRead + Unpin,
    mut terminal: Terminal,
) -> std::io::Result<()> {
    let mut buf = [0u8; 4096];
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        terminal.write(&buf[..n]).await?;
    }
}

#[async_trait]
impl BlockExecutor for ProcessExecutor {
    async fn execute(&self, block: &CodeBlock) -> Result<()> {
        let invocation = self.plan(block);

        if let Some((path, contents)) = &invocation.file {
            tokio::fs::create_dir_all(&self.temp_dir).await?;
            tokio::fs::write(path, contents).await?;
            tracing::debug!("Wrote {:?} block to {}", block.language, path.display());
        }
        match &invocation.program {
            Some((program, args)) => self.run(program, args).await,
            None => Ok(()),
        }
    }
}
