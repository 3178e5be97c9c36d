//! Terminal assistant that streams answers from an LLM and can run the code
//! blocks it writes.
//!
//! The streamed answer is fanned out to the terminal, a capture buffer and a
//! fenced-block parser; extracted blocks are executed with local interpreters
//! either as they close or once the answer is complete.

pub mod ai;
pub mod app;
pub mod config;
pub mod error;
pub mod exec;
pub mod models;
pub mod pipeline;
pub mod runner;
pub mod transcribe;

pub use error::{Error, Result};
