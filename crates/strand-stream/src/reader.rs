use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{StreamError, StreamResult};
use crate::source::{AsyncReadSource, ByteSource, BytesSource, ChannelSource, ChunkSource};
use crate::varint::decode_varint;

/// Buffered reader over any [`ByteSource`].
///
/// Pulling is explicit: [`ensure_read`](Self::ensure_read) is the only
/// suspension point. Everything else operates on what is already buffered and
/// fails with [`StreamError::Underflow`] (or [`StreamError::Closed`] once the
/// source is drained) instead of waiting.
pub struct StreamReader {
    source: Box<dyn ByteSource>,
    buf: BytesMut,
    exhausted: bool,
    consumed: u64,
}

impl StreamReader {
    pub fn new(source: impl ByteSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            buf: BytesMut::new(),
            exhausted: false,
            consumed: 0,
        }
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        Self::new(BytesSource::new(data))
    }

    pub fn from_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: Send + 'static,
    {
        Self::new(ChunkSource::new(chunks))
    }

    pub fn from_async_read<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self::new(AsyncReadSource::new(reader))
    }

    pub fn from_channel(rx: mpsc::Receiver<Bytes>) -> Self {
        Self::new(ChannelSource::new(rx))
    }

    /// A reader with nothing to read.
    pub fn empty() -> Self {
        Self::from_chunks(std::iter::empty())
    }

    /// Bytes currently buffered.
    pub fn available(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes consumed since construction.
    pub fn position(&self) -> u64 {
        self.consumed
    }

    /// `true` once the source is exhausted and the buffer drained.
    pub fn is_finished(&self) -> bool {
        self.exhausted && self.buf.is_empty()
    }

    /// Pull until at least `n` bytes are buffered or the source runs dry.
    ///
    /// `n == 0` means "whatever is available": at most one chunk is pulled,
    /// and only if the buffer is empty. Returns whether `n` bytes (for
    /// `n == 0`, any bytes) are now buffered.
    pub async fn ensure_read(&mut self, n: usize) -> StreamResult<bool> {
        let want = n.max(1);
        while self.buf.len() < want && !self.exhausted {
            match self.source.pull().await? {
                Some(chunk) => {
                    trace!(len = chunk.len(), buffered = self.buf.len(), "pulled chunk");
                    self.buf.extend_from_slice(&chunk);
                }
                None => self.exhausted = true,
            }
            if n == 0 {
                break;
            }
        }
        Ok(self.buf.len() >= want)
    }

    /// The buffered bytes, without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    pub fn consume(&mut self, n: usize) -> StreamResult<()> {
        self.check(n)?;
        self.buf.advance(n);
        self.consumed += n as u64;
        Ok(())
    }

    fn check(&self, needed: usize) -> StreamResult<()> {
        if self.buf.len() >= needed {
            return Ok(());
        }
        Err(self.short(needed))
    }

    fn short(&self, needed: usize) -> StreamError {
        if self.is_finished() {
            return StreamError::Closed;
        }
        StreamError::Underflow {
            needed,
            available: self.buf.len(),
        }
    }

    pub fn read_u8(&mut self) -> StreamResult<u8> {
        self.check(1)?;
        self.consumed += 1;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16_le(&mut self) -> StreamResult<u16> {
        self.check(2)?;
        self.consumed += 2;
        Ok(self.buf.get_u16_le())
    }

    pub fn read_u32_le(&mut self) -> StreamResult<u32> {
        self.check(4)?;
        self.consumed += 4;
        Ok(self.buf.get_u32_le())
    }

    pub fn read_u64_le(&mut self) -> StreamResult<u64> {
        self.check(8)?;
        self.consumed += 8;
        Ok(self.buf.get_u64_le())
    }

    /// Read a buffered varint. A varint cut off by the end of the buffer is
    /// an underflow by one byte past what is buffered.
    pub fn read_varint(&mut self) -> StreamResult<u64> {
        match decode_varint(&self.buf)? {
            Some((value, used)) => {
                self.consume(used)?;
                Ok(value)
            }
            None => Err(self.short(self.buf.len() + 1)),
        }
    }

    /// Exactly `n` buffered bytes, copied out so the result does not pin
    /// the reader's buffer.
    pub fn read_sync(&mut self, n: usize) -> StreamResult<Bytes> {
        self.check(n)?;
        let out = Bytes::copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        self.consumed += n as u64;
        Ok(out)
    }

    /// Up to `max` buffered bytes, split off without copying. Returns an
    /// empty buffer when nothing is buffered.
    pub fn read_any(&mut self, max: usize) -> Bytes {
        let n = max.min(self.buf.len());
        self.consumed += n as u64;
        self.buf.split_to(n).freeze()
    }

    /// Pull as needed, then take exactly `n` bytes.
    pub async fn read_exact(&mut self, n: usize) -> StreamResult<Bytes> {
        self.ensure_read(n).await?;
        self.check(n)?;
        self.consumed += n as u64;
        Ok(self.buf.split_to(n).freeze())
    }

    /// Next available chunk, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> StreamResult<Option<Bytes>> {
        if !self.ensure_read(0).await? {
            return Ok(None);
        }
        Ok(Some(self.read_any(usize::MAX)))
    }

    /// Drain the source into one buffer.
    pub async fn read_to_end(&mut self) -> StreamResult<Bytes> {
        while !self.exhausted {
            match self.source.pull().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => self.exhausted = true,
            }
        }
        let n = self.buf.len();
        Ok(self.read_any(n))
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("buffered", &self.buf.len())
            .field("consumed", &self.consumed)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
