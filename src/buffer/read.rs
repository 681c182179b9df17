//! Fixed-size read buffer with oversize fallback

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a fill did not complete
#[derive(Debug)]
pub enum FillError {
    /// Underlying stream failed
    Io(io::Error),
    /// Stream reached EOF before the requested bytes arrived
    Eof,
    /// Deadline elapsed
    Timeout,
    /// Caller's cancellation token fired
    Cancelled,
    /// Connector-wide abort (the connector is being broken)
    Aborted,
}

/// Deadline and interruption sources for one fill
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadLimits<'a> {
    /// Absolute deadline for the whole `ensure`/`skip` call
    pub deadline: Option<Instant>,
    /// Caller cancellation; firing yields [`FillError::Cancelled`]
    pub cancel: Option<&'a CancellationToken>,
    /// Connector abort; firing yields [`FillError::Aborted`]
    pub abort: Option<&'a CancellationToken>,
}

/// Read buffer over a fixed-size arena
///
/// Bytes between `read_pos` and `filled` are buffered and unread. The
/// primitive `read_*` accessors never perform I/O: the caller must have
/// called [`ensure`](Self::ensure) for enough bytes first.
pub struct ReadBuffer {
    arena: Box<[u8]>,
    read_pos: usize,
    filled: usize,
    /// Regular arena, parked while an oversized one is active
    original: Option<Box<[u8]>>,
}

impl std::fmt::Debug for ReadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("capacity", &self.arena.len())
            .field("read_pos", &self.read_pos)
            .field("filled", &self.filled)
            .field("oversized", &self.original.is_some())
            .finish()
    }
}

impl ReadBuffer {
    /// Create a buffer with a fixed arena of `size` bytes
    pub fn new(size: usize) -> Self {
        Self {
            arena: vec![0u8; size.max(16)].into_boxed_slice(),
            read_pos: 0,
            filled: 0,
            original: None,
        }
    }

    /// Number of buffered, unread bytes
    pub fn available(&self) -> usize {
        self.filled - self.read_pos
    }

    /// Size of the active arena
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    /// Whether an oversized arena is currently active
    pub fn is_oversized(&self) -> bool {
        self.original.is_some()
    }

    /// Identity of the active arena (its address)
    pub fn arena_id(&self) -> usize {
        self.arena.as_ptr() as usize
    }

    /// Guarantee at least `n` contiguous buffered bytes, reading as needed
    ///
    /// If `n` exceeds the arena, a temporary arena sized to `n` replaces it
    /// until [`restore`](Self::restore) is called.
    pub async fn ensure<R>(
        &mut self,
        stream: &mut R,
        n: usize,
        limits: &ReadLimits<'_>,
    ) -> Result<(), FillError>
    where
        R: AsyncRead + Unpin,
    {
        if self.available() >= n {
            return Ok(());
        }

        if n > self.arena.len() {
            self.grow(n);
        } else if self.read_pos + n > self.arena.len() {
            self.compact();
        }

        while self.available() < n {
            self.fill(stream, limits).await?;
        }
        Ok(())
    }

    /// Discard `*remaining` bytes, reading only as much as needed and never growing the arena
    ///
    /// `remaining` is decremented as bytes are discarded, so an interrupted
    /// skip can be resumed.
    pub async fn skip<R>(
        &mut self,
        stream: &mut R,
        remaining: &mut usize,
        limits: &ReadLimits<'_>,
    ) -> Result<(), FillError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let take = (*remaining).min(self.available());
            self.read_pos += take;
            *remaining -= take;
            if *remaining == 0 {
                return Ok(());
            }
            // Buffer drained: reuse the whole arena for the next chunk
            self.read_pos = 0;
            self.filled = 0;
            self.fill(stream, limits).await?;
        }
    }

    /// Switch back to the regular arena once the oversized message is consumed
    ///
    /// Unread bytes that belong to following messages are carried over. If
    /// they do not fit the regular arena the oversized one stays active.
    pub fn restore(&mut self) {
        let Some(mut original) = self.original.take() else {
            return;
        };
        let available = self.available();
        if available > original.len() {
            self.original = Some(original);
            return;
        }
        original[..available].copy_from_slice(&self.arena[self.read_pos..self.filled]);
        self.arena = original;
        self.read_pos = 0;
        self.filled = available;
    }

    /// Drop all buffered bytes and return to the regular arena
    pub fn clear(&mut self) {
        if let Some(original) = self.original.take() {
            self.arena = original;
        }
        self.read_pos = 0;
        self.filled = 0;
    }

    /// Unread bytes, without consuming them
    pub fn peek(&self, n: usize) -> &[u8] {
        &self.arena[self.read_pos..self.read_pos + n]
    }

    /// Consume `n` buffered bytes
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.available(), "consume past buffered data");
        self.read_pos += n;
    }

    /// Read one byte
    pub fn read_u8(&mut self) -> u8 {
        let b = self.arena[self.read_pos];
        self.read_pos += 1;
        b
    }

    /// Read a big-endian i16
    pub fn read_i16(&mut self) -> i16 {
        i16::from_be_bytes(self.take::<2>())
    }

    /// Read a big-endian i32
    pub fn read_i32(&mut self) -> i32 {
        i32::from_be_bytes(self.take::<4>())
    }

    /// Read a big-endian f64
    pub fn read_f64(&mut self) -> f64 {
        f64::from_be_bytes(self.take::<8>())
    }

    /// Read `n` bytes
    pub fn read_bytes(&mut self, n: usize) -> &[u8] {
        assert!(n <= self.available(), "read past buffered data");
        let start = self.read_pos;
        self.read_pos += n;
        &self.arena[start..start + n]
    }

    /// Read a NUL-terminated string (terminator consumed, not returned)
    ///
    /// Returns `None` when no terminator is buffered; nothing is consumed then.
    pub fn read_cstr(&mut self) -> Option<&[u8]> {
        let window = &self.arena[self.read_pos..self.filled];
        let end = window.iter().position(|&b| b == 0)?;
        let start = self.read_pos;
        self.read_pos += end + 1;
        Some(&self.arena[start..start + end])
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.arena[self.read_pos..self.read_pos + N]);
        self.read_pos += N;
        out
    }

    fn compact(&mut self) {
        let available = self.available();
        self.arena.copy_within(self.read_pos..self.filled, 0);
        self.read_pos = 0;
        self.filled = available;
    }

    fn grow(&mut self, n: usize) {
        let available = self.available();
        let mut bigger = vec![0u8; n].into_boxed_slice();
        bigger[..available].copy_from_slice(&self.arena[self.read_pos..self.filled]);
        let previous = std::mem::replace(&mut self.arena, bigger);
        // Keep the regular arena only; an earlier oversized one is dropped
        if self.original.is_none() {
            self.original = Some(previous);
        }
        self.read_pos = 0;
        self.filled = available;
        tracing::debug!(size = n, "switched to oversized read buffer");
    }

    async fn fill<R>(&mut self, stream: &mut R, limits: &ReadLimits<'_>) -> Result<usize, FillError>
    where
        R: AsyncRead + Unpin,
    {
        if self.filled == self.arena.len() {
            self.compact();
        }
        let read = stream.read(&mut self.arena[self.filled..]);
        let n = tokio::select! {
            biased;
            _ = wait_cancelled(limits.abort) => return Err(FillError::Aborted),
            _ = wait_cancelled(limits.cancel) => return Err(FillError::Cancelled),
            _ = wait_deadline(limits.deadline) => return Err(FillError::Timeout),
            res = read => res.map_err(FillError::Io)?,
        };
        if n == 0 {
            return Err(FillError::Eof);
        }
        self.filled += n;
        Ok(n)
    }
}

async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
