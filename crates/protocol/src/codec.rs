//! Newline-delimited framing
//!
//! Lines have no length limit. Each segment is decoded on its own so a bad
//! line never poisons the rest of the stream.

use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Reads one protocol line at a time from a buffered stream
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
        }
    }

    /// Read the next non-empty line.
    ///
    /// The outer `Result` is a stream failure (fatal); `Ok(None)` is EOF; the
    /// inner `Result` reports a line that could not be decoded as UTF-8, which
    /// callers are expected to log and skip.
    pub async fn next_line(
        &mut self,
    ) -> Result<Option<Result<String, ProtocolError>>, ProtocolError> {
        loop {
            self.buf.clear();
            let n = self.inner.read_until(b'\n', &mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }

            let mut end = self.buf.len();
            while end > 0 && matches!(self.buf[end - 1], b'\n' | b'\r') {
                end -= 1;
            }
            let segment = &self.buf[..end];
            if segment.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            return Ok(Some(
                std::str::from_utf8(segment)
                    .map(str::to_owned)
                    .map_err(|_| ProtocolError::InvalidUtf8),
            ));
        }
    }
}

/// Serialize `message` as a single line and flush it
pub async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
