//! Rebuilding a record from its checkpoint and delta log.

use strand_codec::{decode_batch, from_bytes};
use strand_store::StoredRecord;
use strand_types::{Document, RecordId};
use tracing::{debug, warn};

use crate::config::ReplayMode;
use crate::error::{PersistError, PersistResult};
use crate::log::FrameReader;

/// Outcome of replaying one record.
#[derive(Debug)]
pub struct Replayed {
    pub document: Document,
    /// Batches applied on top of the checkpoint.
    pub applied: usize,
    /// Batches skipped in lenient mode.
    pub skipped: usize,
    /// Deltas applied since the checkpoint, so checkpoint cadence resumes
    /// where it left off.
    pub since_checkpoint: u32,
}

/// Decode the checkpoint (or start from an empty shell keyed by `key`) and
/// apply every logged batch after it, in order.
///
/// Each batch applies atomically: a batch that fails part way leaves the
/// document as it was before the batch. In strict mode that failure ends the
/// replay with [`PersistError::Replay`]; in lenient mode it is logged and the
/// batch skipped. An unreadable checkpoint is always fatal.
pub async fn replay(key: &RecordId, stored: StoredRecord, mode: ReplayMode) -> PersistResult<Replayed> {
    let StoredRecord { checkpoint, deltas } = stored;
    let strict = mode.is_strict(checkpoint.is_some());
    let mut document = match checkpoint {
        Some(bytes) => restore(key, &bytes)?,
        None => Document::new(key.clone()),
    };

    let mut frames = FrameReader::new(deltas);
    let (mut batch, mut applied, mut skipped, mut since_checkpoint) = (0usize, 0usize, 0usize, 0u32);
    while let Some(frame) = frames.next_frame().await? {
        let result = frame.into_payload().and_then(|payload| {
            let deltas = decode_batch(&payload)?;
            document.apply_batch(&deltas)?;
            Ok(deltas.len())
        });
        match result {
            Ok(n) => {
                applied += 1;
                since_checkpoint += n as u32;
            }
            Err(e) if strict => {
                return Err(PersistError::Replay {
                    key: key.to_string(),
                    batch,
                    reason: e.to_string(),
                })
            }
            Err(e) => {
                warn!(key = %key, batch, error = %e, "skipping unreadable delta batch");
                skipped += 1;
            }
        }
        batch += 1;
    }

    debug!(key = %key, applied, skipped, strict, "record replayed");
    Ok(Replayed {
        document,
        applied,
        skipped,
        since_checkpoint,
    })
}

fn restore(key: &RecordId, bytes: &[u8]) -> PersistResult<Document> {
    let unreadable = |reason: String| PersistError::Checkpoint {
        key: key.to_string(),
        reason,
    };
    let fragment = from_bytes(bytes).map_err(|e| unreadable(e.to_string()))?;
    Document::from_fragment(key.clone(), fragment).map_err(|e| unreadable(e.to_string()))
}
