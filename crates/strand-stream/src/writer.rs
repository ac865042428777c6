use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::{StreamError, StreamResult};
use crate::reader::StreamReader;
use crate::sink::{AsyncWriteSink, ByteSink, ChannelSink, CollectSink, Collected};
use crate::varint::encode_varint;

/// Default fill level at which [`StreamWriter::maybe_flush`] pushes to the sink.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 64 * 1024;

/// Buffered writer over any [`ByteSink`].
///
/// Writes only append to the in-memory buffer and never fail; bytes reach
/// the sink on [`maybe_flush`](Self::maybe_flush) once the buffer passes its
/// threshold, or on an explicit [`flush`](Self::flush).
pub struct StreamWriter {
    sink: Box<dyn ByteSink>,
    buf: BytesMut,
    threshold: usize,
    flushed: u64,
    closed: bool,
}

impl StreamWriter {
    pub fn new(sink: impl ByteSink + 'static) -> Self {
        Self::with_threshold(sink, DEFAULT_FLUSH_THRESHOLD)
    }

    pub fn with_threshold(sink: impl ByteSink + 'static, threshold: usize) -> Self {
        Self {
            sink: Box::new(sink),
            buf: BytesMut::new(),
            threshold,
            flushed: 0,
            closed: false,
        }
    }

    /// A writer that collects everything into one blob, readable through the
    /// returned handle.
    pub fn collect() -> (Self, Collected) {
        let (sink, handle) = CollectSink::with_handle();
        (Self::new(sink), handle)
    }

    pub fn from_async_write<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(AsyncWriteSink::new(writer))
    }

    pub fn from_channel(tx: mpsc::Sender<Bytes>) -> Self {
        Self::new(ChannelSink::new(tx))
    }

    /// Direct access to the pending buffer for bulk encoders.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes written but not yet pushed to the sink.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Total bytes written, flushed or not.
    pub fn position(&self) -> u64 {
        self.flushed + self.buf.len() as u64
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.buf.put_u16_le(v);
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn write_u64_le(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn write_varint(&mut self, v: u64) {
        encode_varint(&mut self.buf, v);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Push the buffer if it has reached the threshold. Returns whether a
    /// push happened.
    pub async fn maybe_flush(&mut self) -> StreamResult<bool> {
        if self.buf.len() < self.threshold {
            return Ok(false);
        }
        self.push_buffer().await?;
        Ok(true)
    }

    /// Push everything buffered. With `done`, also close the sink; any
    /// later flush fails with [`StreamError::AlreadyClosed`].
    pub async fn flush(&mut self, done: bool) -> StreamResult<()> {
        self.push_buffer().await?;
        if done {
            self.closed = true;
            self.sink.close().await?;
            trace!(total = self.flushed, "stream closed");
        }
        Ok(())
    }

    async fn push_buffer(&mut self) -> StreamResult<()> {
        if self.closed {
            return Err(StreamError::AlreadyClosed);
        }
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.flushed += chunk.len() as u64;
        trace!(len = chunk.len(), "flushing chunk");
        self.sink.push(chunk).await
    }
}

impl std::fmt::Debug for StreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWriter")
            .field("buffered", &self.buf.len())
            .field("flushed", &self.flushed)
            .field("closed", &self.closed)
            .finish()
    }
}

/// A writer and a reader joined by a single-slot mailbox.
///
/// Each flush hands one chunk to the reader; a second flush waits until the
/// reader has taken the first. Closing the writer ends the reader's stream.
pub fn passthrough(threshold: usize) -> (StreamWriter, StreamReader) {
    let (tx, rx) = mpsc::channel(1);
    (
        StreamWriter::with_threshold(ChannelSink::new(tx), threshold),
        StreamReader::from_channel(rx),
    )
}
