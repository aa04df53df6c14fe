use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Ordered mapping of line substrings to event names. Registration order is
/// the dispatch order when one line hits several substrings.
#[derive(Debug, Clone, Default)]
pub struct EventMap(Vec<(String, String)>);

impl EventMap {
    /// An empty map; lines pass through to the sink untouched.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `event` to fire for every completed line containing
    /// `substring`.
    pub fn on<S, E>(mut self, substring: S, event: E) -> Self
    where
        S: Into<String>,
        E: Into<String>,
    {
        self.0.push((substring.into(), event.into()));
        self
    }
}

/// Handler invoked for each event hit, with the event name and the full
/// line as payload. Runs on the reader task: return quickly.
pub type EventHandler = Box<dyn FnMut(&str, &str) + Send>;

/// A write-through sink that scrapes events out of a byte stream.
///
/// Every byte is forwarded to the underlying sink (the server's
/// `stdout.log`); bytes are also buffered line-wise, and each completed
/// line is teed into the harness log and tested against the event map.
/// Lines are `\n`-delimited; a trailing `\r` is stripped so `\r\n` streams
/// behave the same. A final line never terminated before [`finish`] is
/// discarded.
///
/// [`finish`]: LogEventStream::finish
pub struct LogEventStream<W> {
    sink: W,
    events: EventMap,
    handler: EventHandler,
    partial: Vec<u8>,
    server: String,
}

impl<W> LogEventStream<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wraps `sink`, dispatching hits on `events` to `handler`. `server`
    /// names the origin in the teed harness log.
    pub fn new<S: Into<String>>(sink: W, events: EventMap, server: S, handler: EventHandler) -> Self {
        Self {
            sink,
            events,
            handler,
            partial: Vec::new(),
            server: server.into(),
        }
    }

    /// Forwards `bytes` to the sink and dispatches any lines they complete.
    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.sink.write_all(bytes).await?;
        for &byte in bytes {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.partial);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.dispatch(&String::from_utf8_lossy(&line));
            } else {
                self.partial.push(byte);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, line: &str) {
        tracing::debug!(server = %self.server, line, "server output");
        for (substring, event) in &self.events.0 {
            if line.contains(substring.as_str()) {
                (self.handler)(event, line);
            }
        }
    }

    /// Flushes and returns the sink. Any unterminated partial line is
    /// dropped.
    pub async fn finish(mut self) -> io::Result<W> {
        if !self.partial.is_empty() {
            tracing::trace!(
                server = %self.server,
                dropped = %String::from_utf8_lossy(&self.partial),
                "discarding unterminated line"
            );
        }
        self.sink.flush().await?;
        Ok(self.sink)
    }
}
