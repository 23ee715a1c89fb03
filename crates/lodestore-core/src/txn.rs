//! Exclusive write transactions.
//!
//! A `WriteTxn` stages puts and deletes in memory and commits them as one
//! frame. Either every op in the batch becomes visible (and survives a crash)
//! or none does.

use std::sync::atomic::Ordering;

use parking_lot::MutexGuard;
use tracing::{debug, trace};

use crate::engine::{Engine, ValuePointer};
use crate::error::{EngineError, EngineResult};
use crate::format::{encode_batch, BatchOp, Operation};
use crate::segment::SegmentWriter;

/// Summary of a committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitInfo {
    pub sequence: u64,
    pub ops: usize,
    /// Frame size on disk
    pub bytes: u64,
}

/// Write transaction holding the engine's writer lock.
///
/// Dropping without `commit` discards every staged op.
pub struct WriteTxn<'e> {
    engine: &'e Engine,
    writer: MutexGuard<'e, SegmentWriter>,
    ops: Vec<BatchOp>,
}

impl<'e> WriteTxn<'e> {
    pub(crate) fn new(engine: &'e Engine, writer: MutexGuard<'e, SegmentWriter>) -> Self {
        Self {
            engine,
            writer,
            ops: Vec::new(),
        }
    }

    /// Stage a put. Fails if the key or value exceeds the configured limits.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.check_key(key)?;
        let max = self.engine.config.max_value_size;
        if value.len() > max {
            return Err(EngineError::OversizedEntry {
                component: "value",
                size: value.len() as u64,
                max: max as u64,
            });
        }
        self.ops.push(BatchOp::put(key, value));
        Ok(())
    }

    /// Stage a delete. Deleting an absent key is a no-op at commit.
    pub fn delete(&mut self, key: &[u8]) -> EngineResult<()> {
        self.check_key(key)?;
        self.ops.push(BatchOp::delete(key));
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> EngineResult<()> {
        let max = self.engine.config.max_key_size;
        if key.is_empty() || key.len() > max {
            return Err(EngineError::OversizedEntry {
                component: "key",
                size: key.len() as u64,
                max: max as u64,
            });
        }
        Ok(())
    }

    /// Staged op count.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Write the batch durably, then publish it to readers.
    ///
    /// An empty transaction commits without touching disk.
    pub fn commit(mut self) -> EngineResult<CommitInfo> {
        let engine = self.engine;
        let sequence = engine.next_sequence.fetch_add(1, Ordering::SeqCst);
        if self.ops.is_empty() {
            return Ok(CommitInfo {
                sequence,
                ops: 0,
                bytes: 0,
            });
        }

        let frame = encode_batch(sequence, &self.ops);
        let previous_segment = self.writer.sequence();
        let (segment, frame_offset) = self.writer.append_frame(&frame.bytes)?;
        if segment != previous_segment {
            engine.segment_list.lock().push(segment);
        }

        {
            let mut keydir = engine.keydir.write();
            for (op, value_offset) in self.ops.iter().zip(&frame.value_offsets) {
                match op.operation {
                    Operation::Put => keydir.apply_put(
                        &op.key,
                        ValuePointer {
                            segment,
                            offset: frame_offset + value_offset,
                            len: op.value.len() as u32,
                        },
                    ),
                    Operation::Delete => keydir.apply_delete(&op.key),
                }
            }
        }

        let bytes = frame.bytes.len() as u64;
        let ops = self.ops.len();
        engine.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        engine.commits.fetch_add(1, Ordering::Relaxed);

        trace!(target: "lodestore::engine", sequence, ops, bytes, "Committed batch");
        Ok(CommitInfo {
            sequence,
            ops,
            bytes,
        })
    }

    /// Discard every staged op and release the writer lock.
    pub fn rollback(mut self) {
        if !self.ops.is_empty() {
            debug!(
                target: "lodestore::engine",
                ops = self.ops.len(),
                "Rolled back write transaction"
            );
        }
        self.ops.clear();
    }
}

impl std::fmt::Debug for WriteTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTxn").field("ops", &self.ops.len()).finish()
    }
}
