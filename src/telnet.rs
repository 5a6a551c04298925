//! Raw byte-stream connection to the TurboGOLDEN host.
//!
//! The host speaks a plain 8-bit-clean stream: every byte value 0-255 is
//! legal and must survive the trip through the bridge unchanged, because the
//! host emits raw terminal control sequences the browser terminal renders
//! verbatim. Nothing here decodes or reinterprets the payload.

use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Read chunk size for socket drains. Host screens are 80x24, so a full
/// redraw fits in a single chunk with room to spare.
const READ_CHUNK: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum TelnetError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("timed out waiting for {marker:?}")]
    ReadTimeout { marker: String },

    #[error("connection closed by host")]
    Closed,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// One raw, ordered, bidirectional byte stream to the host.
///
/// Exclusively owned by a single session: it is either held whole (during
/// the handshake) or split into its read/write halves, each consumed by
/// exactly one background task. Never shared, closed at most once.
#[derive(Debug)]
pub struct TelnetStream {
    stream: TcpStream,
    /// Bytes read past a marker by `read_until`; drained before the socket
    /// by every subsequent read so nothing is lost or reordered.
    rbuf: BytesMut,
    eof: bool,
}

impl TelnetStream {
    /// Open a connection to `host:port`, bounded by `timeout`.
    ///
    /// TCP_NODELAY is applied before any byte is exchanged. Keystroke-sized
    /// writes dominate this protocol and Nagle coalescing makes interactive
    /// use visibly sluggish.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TelnetError> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| TelnetError::ConnectTimeout {
                addr: addr.clone(),
                timeout,
            })?
            .map_err(|source| TelnetError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        tracing::debug!(%addr, "connected to host, TCP_NODELAY set");
        Ok(Self {
            stream,
            rbuf: BytesMut::new(),
            eof: false,
        })
    }

    /// Read until `marker` has been observed, bounded by `timeout`.
    ///
    /// Returns everything up to and including the marker. Bytes that arrive
    /// after the marker in the same chunk stay buffered for the next read.
    pub async fn read_until(
        &mut self,
        marker: &[u8],
        timeout: Duration,
    ) -> Result<Bytes, TelnetError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(pos) = find_marker(&self.rbuf, marker) {
                return Ok(self.rbuf.split_to(pos + marker.len()).freeze());
            }
            if self.eof {
                return Err(TelnetError::Closed);
            }
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| TelnetError::ReadTimeout {
                    marker: String::from_utf8_lossy(marker).into_owned(),
                })?;
            let mut chunk = [0u8; READ_CHUNK];
            let n = tokio::time::timeout(remaining, self.stream.read(&mut chunk))
                .await
                .map_err(|_| TelnetError::ReadTimeout {
                    marker: String::from_utf8_lossy(marker).into_owned(),
                })??;
            if n == 0 {
                self.eof = true;
                continue;
            }
            self.rbuf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Return whatever bytes are available right now, without waiting.
    ///
    /// An empty result means "nothing yet", not end-of-stream; end-of-stream
    /// surfaces as [`TelnetError::Closed`] once all buffered bytes have been
    /// handed out.
    pub fn read_available(&mut self) -> Result<Bytes, TelnetError> {
        drain_available(&self.stream, &mut self.rbuf, &mut self.eof)
    }

    /// Write `data` to the host verbatim.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TelnetError> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the connection. Idempotent, never fails.
    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// Split into independently owned read/write halves.
    ///
    /// Bytes already buffered (read past a handshake marker) move into the
    /// read half so the session's first output is complete.
    pub fn into_split(self) -> (TelnetReader, TelnetWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            TelnetReader {
                half: read_half,
                rbuf: self.rbuf,
                eof: self.eof,
            },
            TelnetWriter { half: write_half },
        )
    }
}

/// Read half of a split [`TelnetStream`], owned by the session's read pump.
pub struct TelnetReader {
    half: OwnedReadHalf,
    rbuf: BytesMut,
    eof: bool,
}

impl TelnetReader {
    /// Non-blocking drain, same contract as [`TelnetStream::read_available`].
    pub fn read_available(&mut self) -> Result<Bytes, TelnetError> {
        drain_available(&self.half, &mut self.rbuf, &mut self.eof)
    }
}

/// Write half of a split [`TelnetStream`], owned by the session's writer task.
pub struct TelnetWriter {
    half: OwnedWriteHalf,
}

impl TelnetWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), TelnetError> {
        self.half.write_all(data).await?;
        self.half.flush().await?;
        Ok(())
    }
}

/// Shared non-blocking drain over anything `try_read`-able.
///
/// `try_read` works through a shared reference on both `TcpStream` and its
/// owned halves, which is what lets the stream and reader reuse this.
fn drain_available<S: TryRead>(
    stream: &S,
    rbuf: &mut BytesMut,
    eof: &mut bool,
) -> Result<Bytes, TelnetError> {
    let mut out = if rbuf.is_empty() {
        BytesMut::new()
    } else {
        rbuf.split()
    };
    if !*eof {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.try_read(&mut chunk) {
                Ok(0) => {
                    *eof = true;
                    break;
                }
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TelnetError::Io(e)),
            }
        }
    }
    if out.is_empty() && *eof {
        return Err(TelnetError::Closed);
    }
    Ok(out.freeze())
}

trait TryRead {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
}

impl TryRead for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }
}

impl TryRead for OwnedReadHalf {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        OwnedReadHalf::try_read(self, buf)
    }
}

fn find_marker(haystack: &[u8], marker: &[u8]) -> Option<usize> {
    if marker.is_empty() || haystack.len() < marker.len() {
        return None;
    }
    haystack.windows(marker.len()).position(|w| w == marker)
}
