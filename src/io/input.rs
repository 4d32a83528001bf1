use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 16 * 1024;

/// Buffered reader over a socket read half.
///
/// `next_chunk` yields data in arrival order. A consumer that cannot use a
/// whole chunk pushes the tail back with `unread` and receives it again on
/// the next call. Pausing the source is the pull model: a paused reader is
/// simply not polled.
///
/// A connection reset is reported as EOF; the peer is gone either way and
/// the call sites treat both identically.
pub struct BufferedInput<R> {
    reader: R,
    pending: Option<Bytes>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> BufferedInput<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            pending: None,
            eof: false,
        }
    }

    /// Returns the next chunk, a previously unread tail first. `None` means
    /// EOF (or connection reset).
    pub async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        if let Some(chunk) = self.pending.take() {
            return Ok(Some(chunk));
        }
        if self.eof {
            return Ok(None);
        }

        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        match self.reader.read_buf(&mut buf).await {
            Ok(0) => {
                self.eof = true;
                Ok(None)
            }
            Ok(_) => Ok(Some(buf.freeze())),
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
                self.eof = true;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Pushes back the unconsumed tail of the last chunk. It is redelivered
    /// by the next `next_chunk` call.
    pub fn unread(&mut self, tail: Bytes) {
        if !tail.is_empty() {
            debug_assert!(self.pending.is_none());
            self.pending = Some(tail);
        }
    }
}
