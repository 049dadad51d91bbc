//! Output sinks and the byte pumps that feed them
//!
//! Local executions drain their pipes with [`pump`]; remote executions poll
//! non-blocking channel streams through a [`ChunkCopier`]. Both forward
//! whatever a single read returns and flush the sink immediately, so partial
//! lines (prompts, progress bars) reach the caller without waiting for a
//! newline.

use bytes::Bytes;
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

/// Size of the read buffer used by the pumps
pub const PUMP_BUFFER_SIZE: usize = 8192;

/// A writer shared by the workers of one or more executions.
///
/// Writes are serialized by an internal mutex; each chunk is written whole
/// and flushed before the lock is released.
#[derive(Clone)]
pub struct SharedWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl SharedWriter {
    /// Wrap a writer
    pub fn new<W>(writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// Write a chunk and flush it
    pub fn write_chunk(&self, chunk: &[u8]) -> io::Result<()> {
        let mut writer = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(chunk)?;
        writer.flush()
    }
}

impl fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedWriter").finish_non_exhaustive()
    }
}

/// In-memory buffer usable as a sink
#[derive(Clone, Debug, Default)]
pub struct CaptureBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    pub fn snapshot(&self) -> Bytes {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        Bytes::copy_from_slice(&bytes)
    }

    /// Contents decoded as UTF-8, with invalid sequences replaced
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.snapshot()).into_owned()
    }

    /// Number of bytes written so far
    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The pair of destinations a streamed execution writes to
#[derive(Clone, Debug)]
pub struct OutputStreams {
    stdout: SharedWriter,
    stderr: SharedWriter,
}

impl OutputStreams {
    /// Build from explicit writers
    pub fn new(stdout: SharedWriter, stderr: SharedWriter) -> Self {
        Self { stdout, stderr }
    }

    /// The calling process's own stdout and stderr
    pub fn inherit() -> Self {
        Self::new(SharedWriter::new(io::stdout()), SharedWriter::new(io::stderr()))
    }

    /// Separate in-memory buffers for each stream
    pub fn capture() -> (Self, CapturedOutput) {
        let captured = CapturedOutput {
            stdout: CaptureBuffer::new(),
            stderr: CaptureBuffer::new(),
        };
        let streams = Self::new(
            SharedWriter::new(captured.stdout.clone()),
            SharedWriter::new(captured.stderr.clone()),
        );
        (streams, captured)
    }

    /// Destination for stdout
    pub fn stdout(&self) -> &SharedWriter {
        &self.stdout
    }

    /// Destination for stderr
    pub fn stderr(&self) -> &SharedWriter {
        &self.stderr
    }
}

impl Default for OutputStreams {
    fn default() -> Self {
        Self::inherit()
    }
}

/// Buffers filled by [`OutputStreams::capture`]
#[derive(Clone, Debug)]
pub struct CapturedOutput {
    stdout: CaptureBuffer,
    stderr: CaptureBuffer,
}

impl CapturedOutput {
    /// Everything written to stdout
    pub fn stdout(&self) -> Bytes {
        self.stdout.snapshot()
    }

    /// Everything written to stderr
    pub fn stderr(&self) -> Bytes {
        self.stderr.snapshot()
    }

    /// stdout decoded lossily
    pub fn stdout_lossy(&self) -> String {
        self.stdout.to_string_lossy()
    }

    /// stderr decoded lossily
    pub fn stderr_lossy(&self) -> String {
        self.stderr.to_string_lossy()
    }
}

/// Drain an async reader into a sink until EOF.
///
/// Returns the number of bytes read from `reader`. Sink writes run on the
/// blocking pool so a slow consumer never stalls a runtime worker. A failing
/// sink does not stop the pump: the reader keeps being drained so the
/// producer never blocks on a full pipe, and the remaining bytes are
/// discarded.
pub async fn pump<R>(mut reader: R, sink: SharedWriter) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
    let mut total = 0u64;
    let mut sink_ok = true;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            debug!("Pump reached EOF after {} bytes", total);
            return Ok(total);
        }
        total += n as u64;
        if sink_ok {
            let chunk = Bytes::copy_from_slice(&buf[..n]);
            let writer = sink.clone();
            let written = tokio::task::spawn_blocking(move || writer.write_chunk(&chunk))
                .await
                .unwrap_or_else(|e| Err(io::Error::other(e)));
            sink_ok = keep_forwarding(written);
        }
    }
}

/// Result of a single [`ChunkCopier::poll_copy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollRead {
    /// This many bytes were read and forwarded
    Copied(usize),
    /// The reader has nothing right now
    Pending,
    /// The reader returned zero bytes
    Eof,
}

/// Copies from a reader that may return `WouldBlock`, one read per call.
///
/// Used by poll loops that service several non-blocking readers on one
/// thread.
#[derive(Debug)]
pub struct ChunkCopier {
    sink: SharedWriter,
    buf: Vec<u8>,
    total: u64,
    sink_ok: bool,
}

impl ChunkCopier {
    /// Copier feeding `sink`
    pub fn new(sink: SharedWriter) -> Self {
        Self {
            sink,
            buf: vec![0u8; PUMP_BUFFER_SIZE],
            total: 0,
            sink_ok: true,
        }
    }

    /// Perform at most one read and forward what it returned
    pub fn poll_copy<R>(&mut self, reader: &mut R) -> io::Result<PollRead>
    where
        R: Read + ?Sized,
    {
        match reader.read(&mut self.buf) {
            Ok(0) => Ok(PollRead::Eof),
            Ok(n) => {
                self.total += n as u64;
                if self.sink_ok {
                    self.sink_ok = keep_forwarding(self.sink.write_chunk(&self.buf[..n]));
                }
                Ok(PollRead::Copied(n))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {
                Ok(PollRead::Pending)
            }
            Err(e) => Err(e),
        }
    }

    /// Bytes read so far
    pub fn total(&self) -> u64 {
        self.total
    }
}

fn keep_forwarding(written: io::Result<()>) -> bool {
    match written {
        Ok(()) => true,
        Err(e) => {
            warn!("Output sink failed, discarding the rest of the stream: {}", e);
            false
        }
    }
}
