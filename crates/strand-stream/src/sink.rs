use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{StreamError, StreamResult};

/// Push side of a byte stream.
#[async_trait]
pub trait ByteSink: Send {
    async fn push(&mut self, chunk: Bytes) -> StreamResult<()>;

    /// Signal end of stream. Called at most once by [`StreamWriter`](crate::StreamWriter).
    async fn close(&mut self) -> StreamResult<()>;
}

/// Accumulates everything written into one contiguous blob.
pub struct CollectSink {
    blob: Arc<Mutex<CollectState>>,
}

#[derive(Default)]
struct CollectState {
    data: BytesMut,
    closed: bool,
}

/// Read handle for the blob a [`CollectSink`] fills.
#[derive(Clone)]
pub struct Collected {
    blob: Arc<Mutex<CollectState>>,
}

impl CollectSink {
    pub fn with_handle() -> (Self, Collected) {
        let blob = Arc::new(Mutex::new(CollectState::default()));
        (
            Self { blob: blob.clone() },
            Collected { blob },
        )
    }
}

impl Collected {
    /// Everything pushed so far.
    pub fn bytes(&self) -> Bytes {
        let state = self.blob.lock().expect("lock poisoned");
        Bytes::copy_from_slice(&state.data)
    }

    /// Take the collected bytes, leaving the blob empty.
    pub fn take(&self) -> Bytes {
        let mut state = self.blob.lock().expect("lock poisoned");
        state.data.split().freeze()
    }

    pub fn is_closed(&self) -> bool {
        self.blob.lock().expect("lock poisoned").closed
    }
}

#[async_trait]
impl ByteSink for CollectSink {
    async fn push(&mut self, chunk: Bytes) -> StreamResult<()> {
        let mut state = self.blob.lock().expect("lock poisoned");
        state.data.extend_from_slice(&chunk);
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.blob.lock().expect("lock poisoned").closed = true;
        Ok(())
    }
}

/// Adapter for tokio writers. `close` flushes and shuts the writer down.
pub struct AsyncWriteSink<W> {
    inner: W,
}

impl<W> AsyncWriteSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W> ByteSink for AsyncWriteSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn push(&mut self, chunk: Bytes) -> StreamResult<()> {
        self.inner.write_all(&chunk).await?;
        Ok(())
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Sending end of a push stream. A bounded channel makes `push` wait while
/// the consumer is behind.
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Bytes>>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx: Some(tx) }
    }
}

#[async_trait]
impl ByteSink for ChannelSink {
    async fn push(&mut self, chunk: Bytes) -> StreamResult<()> {
        let tx = self.tx.as_ref().ok_or(StreamError::AlreadyClosed)?;
        tx.send(chunk).await.map_err(|_| StreamError::SinkGone)
    }

    async fn close(&mut self) -> StreamResult<()> {
        self.tx.take();
        Ok(())
    }
}
