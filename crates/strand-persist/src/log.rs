//! Delta-log framing.
//!
//! Each flushed delta batch is appended to the record's log as one frame:
//!
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload (encoded delta batch)]
//! ```
//!
//! A frame whose CRC does not match is reported and skipped; the length is
//! still trusted, so later frames stay readable. A truncated frame ends the
//! log.

use bytes::{BufMut, Bytes, BytesMut};
use strand_stream::StreamReader;
use tracing::trace;

use crate::error::{PersistError, PersistResult};

/// Header size: 4 bytes length + 4 bytes CRC.
pub const HEADER_SIZE: usize = 8;

/// Frame `payload` for appending to a delta log.
pub fn frame(payload: &[u8]) -> PersistResult<Bytes> {
    let len = frame_len(payload.len())?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32_le(len);
    buf.put_u32_le(crc32fast::hash(payload));
    buf.put_slice(payload);
    Ok(buf.freeze())
}

fn frame_len(len: usize) -> PersistResult<u32> {
    u32::try_from(len).map_err(|_| PersistError::FrameTooLarge(len))
}

/// One frame read back from a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Entry(Bytes),
    Corrupt { offset: u64, reason: String },
}

impl Frame {
    pub fn into_payload(self) -> PersistResult<Bytes> {
        match self {
            Frame::Entry(payload) => Ok(payload),
            Frame::Corrupt { offset, reason } => Err(PersistError::CorruptFrame { offset, reason }),
        }
    }
}

/// Reads frames off a delta-log stream.
pub struct FrameReader {
    reader: StreamReader,
    done: bool,
}

impl FrameReader {
    pub fn new(reader: StreamReader) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    /// The next frame, or `None` at the end of the log. Errors are I/O
    /// failures of the underlying stream; damaged frames come back as
    /// [`Frame::Corrupt`].
    pub async fn next_frame(&mut self) -> PersistResult<Option<Frame>> {
        if self.done {
            return Ok(None);
        }
        let offset = self.reader.position();
        if !self.reader.ensure_read(HEADER_SIZE).await? {
            self.done = true;
            if self.reader.available() == 0 {
                return Ok(None);
            }
            return Ok(Some(Frame::Corrupt {
                offset,
                reason: "truncated header".into(),
            }));
        }
        let len = self.reader.read_u32_le()? as usize;
        let expected = self.reader.read_u32_le()?;
        if len == 0 {
            self.done = true;
            return Ok(Some(Frame::Corrupt {
                offset,
                reason: "zero-length frame".into(),
            }));
        }
        if !self.reader.ensure_read(len).await? {
            self.done = true;
            return Ok(Some(Frame::Corrupt {
                offset,
                reason: format!("truncated payload: {len} bytes declared"),
            }));
        }
        let payload = self.reader.read_sync(len)?;
        let actual = crc32fast::hash(&payload);
        if actual != expected {
            return Ok(Some(Frame::Corrupt {
                offset,
                reason: format!("crc mismatch: expected {expected:08x}, computed {actual:08x}"),
            }));
        }
        trace!(offset, len, "delta frame");
        Ok(Some(Frame::Entry(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn frames(chunks: Vec<Bytes>) -> Vec<Frame> {
        let mut reader = FrameReader::new(StreamReader::from_chunks(chunks));
        let mut out = Vec::new();
        while let Some(frame) = reader.next_frame().await.unwrap() {
            out.push(frame);
        }
        out
    }

    #[tokio::test]
    async fn frames_read_back_across_chunks() {
        let a = frame(b"first").unwrap();
        let b = frame(b"second").unwrap();
        let mut joined = BytesMut::new();
        joined.extend_from_slice(&a);
        joined.extend_from_slice(&b);
        let joined = joined.freeze();
        let split = vec![joined.slice(..3), joined.slice(3..15), joined.slice(15..)];

        let out = frames(split).await;
        assert_eq!(
            out,
            vec![
                Frame::Entry(Bytes::from_static(b"first")),
                Frame::Entry(Bytes::from_static(b"second")),
            ]
        );
    }

    #[tokio::test]
    async fn crc_mismatch_skips_one_frame() {
        let mut bad = BytesMut::from(&frame(b"payload").unwrap()[..]);
        bad[HEADER_SIZE] ^= 0xff;
        let out = frames(vec![bad.freeze(), frame(b"next").unwrap()]).await;
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], Frame::Corrupt { offset: 0, reason } if reason.contains("crc")));
        assert_eq!(out[1], Frame::Entry(Bytes::from_static(b"next")));
    }

    #[tokio::test]
    async fn truncation_ends_the_log() {
        let whole = frame(b"abcdef").unwrap();
        let out = frames(vec![frame(b"ok").unwrap(), whole.slice(..whole.len() - 2)]).await;
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[1], Frame::Corrupt { offset: 10, .. }));

        let out = frames(vec![Bytes::from_static(&[1, 0, 0])]).await;
        assert!(matches!(&out[..], [Frame::Corrupt { offset: 0, .. }]));
    }

    #[test]
    fn oversized_batches_are_rejected() {
        assert_eq!(frame_len(7).unwrap(), 7);
        assert!(matches!(
            frame_len(u32::MAX as usize + 1),
            Err(PersistError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn empty_log() {
        assert!(frames(vec![]).await.is_empty());
    }

    #[test]
    fn corrupt_frames_become_errors() {
        let frame = Frame::Corrupt {
            offset: 4,
            reason: "x".into(),
        };
        assert!(matches!(
            frame.into_payload(),
            Err(PersistError::CorruptFrame { offset: 4, .. })
        ));
    }
}
