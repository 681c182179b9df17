//! Fixed-capacity write buffer

use crate::protocol::{encode_into, encoded_len, FrontendMessage};
use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Write buffer with a fixed capacity
///
/// Messages are appended until the next one would not fit, at which point
/// the buffer is flushed first. Messages larger than the whole buffer are
/// written straight through.
#[derive(Debug)]
pub struct WriteBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl WriteBuffer {
    /// Create a buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(16);
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes that can still be appended without a flush
    pub fn space_left(&self) -> usize {
        self.capacity - self.buf.len()
    }

    /// Buffered byte count
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Buffer a message, flushing first if it does not fit
    pub async fn write_message<W>(&mut self, stream: &mut W, msg: &FrontendMessage) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let len = encoded_len(msg);
        if len > self.space_left() {
            self.flush(stream).await?;
        }
        if len > self.capacity {
            let mut direct = BytesMut::with_capacity(len);
            encode_into(&mut direct, msg);
            return stream.write_all(&direct).await;
        }
        encode_into(&mut self.buf, msg);
        Ok(())
    }

    /// Buffer a pregenerated blob
    pub async fn write_raw<W>(&mut self, stream: &mut W, bytes: &[u8]) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if bytes.len() > self.space_left() {
            self.flush(stream).await?;
        }
        if bytes.len() > self.capacity {
            return stream.write_all(bytes).await;
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Write all buffered bytes and reset the cursor
    pub async fn flush<W>(&mut self, stream: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.buf.is_empty() {
            stream.write_all(&self.buf).await?;
            self.buf.clear();
        }
        stream.flush().await
    }

    /// Drop buffered bytes without writing them
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
