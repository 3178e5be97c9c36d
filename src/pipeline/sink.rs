//! Write-side sinks for streamed model output.
//!
//! A [`FanOut`] duplicates every write to its downstream sinks in
//! registration order, like `tee(1)`, and closes them together without ever
//! closing a process-owned stream such as stdout.

use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[async_trait]
pub trait Sink: Send {
    /// Write `buf`, returning how many bytes were accepted.
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    async fn close(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Process-owned streams are left open when a fan-out closes.
    fn is_process_stream(&self) -> bool {
        false
    }

    /// Access to the fan-out behind this sink, used to flatten nesting.
    fn as_fan_out(&mut self) -> Option<&mut FanOut> {
        None
    }
}

pub struct FanOut {
    sinks: Vec<Box<dyn Sink>>,
}

impl FanOut {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        let mut flattened = Vec::with_capacity(sinks.len());
        for mut sink in sinks {
            let nested = sink
                .as_fan_out()
                .map(|fan_out| std::mem::take(&mut fan_out.sinks));
            match nested {
                Some(children) => flattened.extend(children),
                None => flattened.push(sink),
            }
        }
        Self { sinks: flattened }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Sink for FanOut {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for sink in self.sinks.iter_mut() {
            let n = sink.write(buf).await?;
            if n != buf.len() {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "short write"));
            }
        }
        Ok(buf.len())
    }

    async fn close(&mut self) -> io::Result<()> {
        let mut first_err = None;
        for sink in self.sinks.iter_mut() {
            if sink.is_process_stream() {
                continue;
            }
            if let Err(e) = sink.close().await {
                tracing::debug!("Failed to close sink: {}", e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn as_fan_out(&mut self) -> Option<&mut FanOut> {
        Some(self)
    }
}

/// The user's terminal, flushed after every write so tokens appear as they
/// arrive. Clones share the underlying writer.
#[derive(Clone)]
pub struct Terminal {
    writer: Arc<tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    process_stream: bool,
}

impl Terminal {
    pub fn stdout() -> Self {
        Self {
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(tokio::io::stdout()))),
            process_stream: true,
        }
    }

    pub fn from_writer(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
            process_stream: false,
        }
    }

    pub async fn write_str(&self, s: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(s.as_bytes()).await?;
        writer.flush().await
    }
}

#[async_trait]
impl Sink for Terminal {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await?;
        writer.flush().await?;
        Ok(buf.len())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }

    fn is_process_stream(&self) -> bool {
        self.process_stream
    }
}

/// In-memory sink capturing everything written to it. Clones share storage.
#[derive(Clone, Default)]
pub struct CaptureBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    fn append(&self, buf: &[u8]) {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
    }
}

#[async_trait]
impl Sink for CaptureBuffer {
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }
}

impl AsyncWrite for CaptureBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.append(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct Recorder {
        written: CaptureBuffer,
        closes: Arc<AtomicUsize>,
    }

    enum Behaviour {
        Normal,
        Short,
        FailWrite,
        FailClose(&'static str),
        ProcessOwned,
    }

    struct RecorderSink {
        recorder: Recorder,
        behaviour: Behaviour,
    }

    impl RecorderSink {
        fn boxed(recorder: &Recorder, behaviour: Behaviour) -> Box<dyn Sink> {
            Box::new(Self {
                recorder: recorder.clone(),
                behaviour,
            })
        }
    }

    #[async_trait]
    impl Sink for RecorderSink {
        async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.behaviour {
                Behaviour::FailWrite => Err(io::Error::new(io::ErrorKind::BrokenPipe, "boom")),
                Behaviour::Short => {
                    let half = buf.len() / 2;
                    self.recorder.written.append(&buf[..half]);
                    Ok(half)
                }
                _ => {
                    self.recorder.written.append(buf);
                    Ok(buf.len())
                }
            }
        }

        async fn close(&mut self) -> io::Result<()> {
            self.recorder.closes.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::FailClose(msg) => Err(io::Error::other(msg)),
                _ => Ok(()),
            }
        }

        fn is_process_stream(&self) -> bool {
            matches!(self.behaviour, Behaviour::ProcessOwned)
        }
    }

    const PAYLOAD: &[u8] = b"sure:\n```bash\necho ok\n```\ndone\n";

    #[tokio::test]
    async fn test_every_partition_reaches_every_sink_in_order() {
        for chunk_size in [1, 2, 3, 7, PAYLOAD.len()] {
            let (a, b, c) = (Recorder::default(), Recorder::default(), Recorder::default());
            let mut fan_out = FanOut::new(vec![
                RecorderSink::boxed(&a, Behaviour::Normal),
                RecorderSink::boxed(&b, Behaviour::Normal),
                RecorderSink::boxed(&c, Behaviour::Normal),
            ]);

            for chunk in PAYLOAD.chunks(chunk_size) {
                assert_eq!(fan_out.write(chunk).await.unwrap(), chunk.len());
            }

            for recorder in [&a, &b, &c] {
                assert_eq!(recorder.written.contents(), PAYLOAD, "chunk size {}", chunk_size);
            }
        }
    }

    #[tokio::test]
    async fn test_write_error_stops_at_failing_sink() {
        let (first, failing, last) = (Recorder::default(), Recorder::default(), Recorder::default());
        let mut fan_out = FanOut::new(vec![
            RecorderSink::boxed(&first, Behaviour::Normal),
            RecorderSink::boxed(&failing, Behaviour::FailWrite),
            RecorderSink::boxed(&last, Behaviour::Normal),
        ]);

        let err = fan_out.write(b"hello").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(first.written.contents(), b"hello");
        assert!(last.written.contents().is_empty());
    }

    #[tokio::test]
    async fn test_short_write_is_an_error() {
        let (short, last) = (Recorder::default(), Recorder::default());
        let mut fan_out = FanOut::new(vec![
            RecorderSink::boxed(&short, Behaviour::Short),
            RecorderSink::boxed(&last, Behaviour::Normal),
        ]);

        let err = fan_out.write(b"abcd").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert!(last.written.contents().is_empty());
    }

    #[tokio::test]
    async fn test_close_skips_process_streams_and_keeps_first_error() {
        let (stdout, first_bad, second_bad, good) = (
            Recorder::default(),
            Recorder::default(),
            Recorder::default(),
            Recorder::default(),
        );
        let mut fan_out = FanOut::new(vec![
            RecorderSink::boxed(&stdout, Behaviour::ProcessOwned),
            RecorderSink::boxed(&first_bad, Behaviour::FailClose("first")),
            RecorderSink::boxed(&second_bad, Behaviour::FailClose("second")),
            RecorderSink::boxed(&good, Behaviour::Normal),
        ]);

        let err = fan_out.close().await.unwrap_err();
        assert_eq!(err.to_string(), "first");
        assert_eq!(stdout.closes.load(Ordering::SeqCst), 0);
        assert_eq!(first_bad.closes.load(Ordering::SeqCst), 1);
        assert_eq!(second_bad.closes.load(Ordering::SeqCst), 1);
        assert_eq!(good.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_nested_fan_out_is_flattened() {
        let (a, b, c) = (Recorder::default(), Recorder::default(), Recorder::default());
        let inner = FanOut::new(vec![
            RecorderSink::boxed(&a, Behaviour::Normal),
            RecorderSink::boxed(&b, Behaviour::Normal),
        ]);
        let mut outer = FanOut::new(vec![
            Box::new(inner),
            RecorderSink::boxed(&c, Behaviour::Normal),
        ]);

        assert_eq!(outer.len(), 3);
        outer.write(b"x").await.unwrap();
        assert_eq!(a.written.contents(), b"x");
        assert_eq!(b.written.contents(), b"x");
        assert_eq!(c.written.contents(), b"x");
    }

    #[tokio::test]
    async fn test_terminal_over_buffer_is_closable() {
        let buffer = CaptureBuffer::new();
        let mut terminal = Terminal::from_writer(buffer.clone());
        assert!(!terminal.is_process_stream());
        assert!(Terminal::stdout().is_process_stream());

        terminal.write(b"hi").await.unwrap();
        terminal.write_str("\n").await.unwrap();
        terminal.close().await.unwrap();
        assert_eq!(buffer.to_string_lossy(), "hi\n");
    }
}
