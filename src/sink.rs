//! Where the listener hands each received message once it has been acknowledged.

use bytes::Bytes;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Width of the zero padded ASCII length header written by [`LengthPrefixedSink`]
pub const LENGTH_HEADER_WIDTH: usize = 11;

/// Receives every fully reassembled, unwrapped message exactly once, in arrival order per connection.
///
/// The listener calls `deliver` from tokio's blocking pool, so an implementation may block on I/O.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: Bytes) -> io::Result<()>;
}

/// Prints each message to stdout, one segment per line.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl MessageSink for StdoutSink {
    fn deliver(&self, message: Bytes) -> io::Result<()> {
        let text = String::from_utf8_lossy(&message).replace('\r', "\n");
        let stdout = io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "{}", text.trim_end())?;
        writeln!(out)?;
        out.flush()
    }
}

/// Forwards each message into an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        ChannelSink { tx }
    }

    /// A sink plus the receiving end of its channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSink { tx }, rx)
    }
}

impl MessageSink for ChannelSink {
    fn deliver(&self, message: Bytes) -> io::Result<()> {
        self.tx
            .send(message)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "message channel closed"))
    }
}

/// Writes `<11 digit length><payload>` records, typically into a named pipe read by a UI process.
#[derive(Debug)]
pub struct LengthPrefixedSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> LengthPrefixedSink<W> {
    pub fn new(writer: W) -> Self {
        LengthPrefixedSink {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.writer
            .into_inner()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "sink writer poisoned"))
    }
}

impl LengthPrefixedSink<File> {
    /// Opens an existing named pipe (or plain file) for writing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().write(true).append(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write + Send> MessageSink for LengthPrefixedSink<W> {
    fn deliver(&self, message: Bytes) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "sink writer poisoned"))?;
        write!(writer, "{:0width$}", message.len(), width = LENGTH_HEADER_WIDTH)?;
        writer.write_all(&message)?;
        writer.flush()
    }
}
