//! Caret protocol handler for the Tokio runtime.

use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::parser::{self, Mode, HANDSHAKE};

/// Per-connection tunables.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Upper bound on a single read.
    pub buffer_size: usize,
    /// Deadline for each individual read or write.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            idle_timeout: None,
        }
    }
}

/// Counters reported when a session ends cleanly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub bytes_read: u64,
    /// Includes the handshake byte.
    pub bytes_written: u64,
    pub frames: u64,
}

/// Reasons a session ends before the peer closes.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("handshake write failed: {0}")]
    Handshake(#[source] io::Error),
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    #[error("no progress within {0:?}")]
    Timeout(Duration),
}

/// One accepted connection and its scanner state.
///
/// The stream is owned for the whole session and dropped exactly once, when
/// [`Session::run`] returns.
pub struct Session<S> {
    stream: S,
    mode: Mode,
    read_buf: Vec<u8>,
    write_buf: BytesMut,
    idle_timeout: Option<Duration>,
    stats: SessionStats,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, options: SessionOptions) -> Self {
        Self {
            stream,
            mode: Mode::Seeking,
            read_buf: vec![0u8; options.buffer_size],
            write_buf: BytesMut::with_capacity(options.buffer_size),
            idle_timeout: options.idle_timeout,
            stats: SessionStats::default(),
        }
    }

    /// Drive the connection until the peer closes or an I/O step fails.
    ///
    /// Reads and writes strictly alternate: a new read is never issued
    /// before the output of the previous one has been fully written.
    pub async fn run(mut self) -> Result<SessionStats, SessionError> {
        self.handshake().await?;

        loop {
            let n = self.read_chunk().await?;
            if n == 0 {
                trace!(mode = ?self.mode, "Connection closed by peer");
                return Ok(self.stats);
            }

            self.process(n);

            // Nothing to send yet is fine; keep waiting for the rest of the frame.
            if !self.write_buf.is_empty() {
                self.write_output().await?;
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), SessionError> {
        let limit = self.idle_timeout;
        with_deadline(
            limit,
            self.stream.write_all(&[HANDSHAKE]),
            SessionError::Handshake,
        )
        .await?;
        self.stats.bytes_written += 1;
        Ok(())
    }

    async fn read_chunk(&mut self) -> Result<usize, SessionError> {
        let limit = self.idle_timeout;
        let n = with_deadline(
            limit,
            self.stream.read(&mut self.read_buf),
            SessionError::Read,
        )
        .await?;
        self.stats.bytes_read += n as u64;
        Ok(n)
    }

    fn process(&mut self, n: usize) {
        self.write_buf.clear();
        let scan = parser::transcode(self.mode, &self.read_buf[..n], &mut self.write_buf);
        trace!(
            read = n,
            output = self.write_buf.len(),
            from = ?self.mode,
            to = ?scan.mode,
            "Transcoded chunk"
        );
        self.mode = scan.mode;
        self.stats.frames += scan.frames_closed;
    }

    async fn write_output(&mut self) -> Result<(), SessionError> {
        let limit = self.idle_timeout;
        with_deadline(
            limit,
            self.stream.write_all(&self.write_buf),
            SessionError::Write,
        )
        .await?;
        self.stats.bytes_written += self.write_buf.len() as u64;
        Ok(())
    }
}

/// Handle a caret protocol connection with the given options.
pub async fn handle_connection<S>(
    stream: S,
    options: SessionOptions,
) -> Result<SessionStats, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Session::new(stream, options).run().await
}

/// Await `op`, mapping an elapsed deadline to [`SessionError::Timeout`] and
/// an I/O failure through `wrap`.
async fn with_deadline<F, T>(
    limit: Option<Duration>,
    op: F,
    wrap: fn(io::Error) -> SessionError,
) -> Result<T, SessionError>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, op)
            .await
            .map_err(|_| SessionError::Timeout(limit))?
            .map_err(wrap),
        None => op.await.map_err(wrap),
    }
}
