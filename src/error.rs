//! Error handling and custom error types
//!
//! Provides unified error handling across the application using thiserror.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown model: {0}")]
    ModelClassification(String),

    #[error("Set {var} env variable to your API key. Get one at {url}")]
    Authentication { var: &'static str, url: &'static str },

    #[error("{0}")]
    AiProvider(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("{capability} is not supported by {provider}")]
    Unsupported {
        provider: &'static str,
        capability: &'static str,
    },

    #[error("{program} exited with status {}", status_text(.code))]
    Execution { program: String, code: Option<i32> },

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Generic(String),
}

fn status_text(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

impl Error {
    /// Exit code a failed run should terminate the process with.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Execution {
                code: Some(code), ..
            } => *code,
            _ => 1,
        }
    }

    /// Recover an error tunnelled through an `io::Error` by a byte stream.
    pub fn from_stream(err: std::io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(inner) = inner.downcast::<Error>() {
                    return *inner;
                }
            }
            return Error::Generic("stream error".to_string());
        }
        Error::Io(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
