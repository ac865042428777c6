use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::error::StreamResult;

/// Pull side of a byte stream.
///
/// `pull` returns the next chunk, or `None` once the source is exhausted.
/// Empty chunks are allowed and carry no meaning.
#[async_trait]
pub trait ByteSource: Send {
    async fn pull(&mut self) -> StreamResult<Option<Bytes>>;
}

/// A single in-memory buffer, yielded in one piece.
pub struct BytesSource {
    data: Option<Bytes>,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: Some(data.into()),
        }
    }
}

#[async_trait]
impl ByteSource for BytesSource {
    async fn pull(&mut self) -> StreamResult<Option<Bytes>> {
        Ok(self.data.take())
    }
}

/// Any iterator of chunks (blob parts, pre-split buffers).
pub struct ChunkSource<I> {
    chunks: I,
}

impl<I> ChunkSource<I>
where
    I: Iterator<Item = Bytes> + Send,
{
    pub fn new(chunks: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            chunks: chunks.into_iter(),
        }
    }
}

#[async_trait]
impl<I> ByteSource for ChunkSource<I>
where
    I: Iterator<Item = Bytes> + Send,
{
    async fn pull(&mut self) -> StreamResult<Option<Bytes>> {
        Ok(self.chunks.next())
    }
}

/// Adapter for tokio readers: files, sockets, pipes.
pub struct AsyncReadSource<R> {
    inner: R,
    chunk_size: usize,
}

impl<R> AsyncReadSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(inner: R) -> Self {
        Self::with_chunk_size(inner, 16 * 1024)
    }

    pub fn with_chunk_size(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait]
impl<R> ByteSource for AsyncReadSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn pull(&mut self) -> StreamResult<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(self.chunk_size);
        let n = self.inner.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }
}

/// Receiving end of a push stream: whoever holds the sender produces chunks.
/// The source is exhausted once every sender is dropped.
pub struct ChannelSource {
    rx: mpsc::Receiver<Bytes>,
}

impl ChannelSource {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl ByteSource for ChannelSource {
    async fn pull(&mut self) -> StreamResult<Option<Bytes>> {
        Ok(self.rx.recv().await)
    }
}
