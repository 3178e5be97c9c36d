//! Streaming output pipeline: sinks the model's bytes are fanned out to and
//! the fenced code block parser that runs alongside them.

pub mod parser;
pub mod sink;

pub use parser::{spawn_parser, BlockWriter, CodeBlock, Language, Scanner};
pub use sink::{CaptureBuffer, FanOut, Sink, Terminal};
