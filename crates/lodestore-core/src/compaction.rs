//! Compaction: dead space reclamation across segments
//!
//! Overwrites and deletes leave stale frames behind. Compaction copies every
//! live pair into fresh segments, repoints the key directory, then deletes the
//! old segments.
//!
//! Crash safety rests on ordering:
//! 1. rotate, so copies land in segments newer than anything being removed
//! 2. append and durable_sync the copied pairs
//! 3. delete old segments in ascending order
//! 4. sync the directory
//!
//! A crash during step 3 leaves a suffix of the old segments followed by the
//! copies. Replaying that suffix cannot resurrect a deleted key: its tombstone
//! sits in a later old segment than the put it shadows, so it is removed last.

use std::fs;
use std::sync::atomic::Ordering;

use tracing::{debug, info};

use crate::engine::{Engine, LiveEntries, ValuePointer};
use crate::error::{EngineError, EngineResult};
use crate::format::{encode_batch, BatchOp};
use crate::platform_durability::sync_directory;
use crate::segment::SegmentWriter;

/// Upper bound for one compaction frame.
const COMPACTION_FRAME_BYTES: u64 = 1024 * 1024;

/// Result of a compaction run.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionResult {
    pub segments_removed: usize,
    pub live_entries: usize,
    /// Bytes across all segments before compaction
    pub original_bytes: u64,
    /// Bytes across all segments after compaction
    pub compacted_bytes: u64,
}

impl CompactionResult {
    /// Ratio of dead space reclaimed (0.0 = none, 1.0 = everything).
    pub fn dead_space_ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        self.bytes_saved() as f64 / self.original_bytes as f64
    }

    /// Space saved in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.compacted_bytes)
    }
}

impl Engine {
    /// Whether the dead byte ratio has crossed the configured trigger.
    pub fn needs_compaction(&self) -> bool {
        let stats = self.stats();
        stats.total_bytes >= self.config.compaction_min_bytes
            && stats.dead_ratio() >= self.config.compaction_trigger_ratio
    }

    /// Compact unconditionally. Blocks writers, readers and scans until done.
    pub fn compact(&self) -> EngineResult<CompactionResult> {
        let mut writer = self.writer.lock();
        let _guard = self.segment_guard.write();
        self.compact_locked(&mut writer)
    }

    /// Compact if needed and nothing else holds the writer or a scan is open.
    ///
    /// Returns `Ok(None)` when compaction was not needed or was skipped.
    pub fn maybe_compact(&self) -> EngineResult<Option<CompactionResult>> {
        if !self.needs_compaction() {
            return Ok(None);
        }
        let Some(mut writer) = self.writer.try_lock() else {
            return Ok(None);
        };
        let Some(_guard) = self.segment_guard.try_write() else {
            debug!(target: "lodestore::compaction", "Skipping compaction while a scan is open");
            return Ok(None);
        };
        if !self.needs_compaction() {
            return Ok(None);
        }
        self.compact_locked(&mut writer).map(Some)
    }

    fn compact_locked(&self, writer: &mut SegmentWriter) -> EngineResult<CompactionResult> {
        let original_bytes = self.total_bytes.load(Ordering::Relaxed);
        let old_segments: Vec<u64> = self.segment_list.lock().clone();

        writer.rotate()?;
        self.segment_list.lock().push(writer.sequence());

        let frame_cap = COMPACTION_FRAME_BYTES.min(self.config.segment_size_bytes);
        let mut batch: Vec<BatchOp> = Vec::new();
        let mut batch_bytes = 0u64;
        let mut live_entries = 0usize;
        let mut compacted_bytes = 0u64;

        for pair in LiveEntries::new(self, old_segments.clone()) {
            let (key, value) = pair?;
            let op = BatchOp::put(&key, &value);
            batch_bytes += op.encoded_len() as u64;
            batch.push(op);
            live_entries += 1;
            if batch_bytes >= frame_cap {
                compacted_bytes += self.write_compacted(writer, &batch)?;
                batch.clear();
                batch_bytes = 0;
            }
        }
        if !batch.is_empty() {
            compacted_bytes += self.write_compacted(writer, &batch)?;
        }

        for segment in &old_segments {
            let path = self.segment_path(*segment);
            fs::remove_file(&path)
                .map_err(|e| EngineError::io(&path, "Failed to remove compacted segment", e))?;
        }
        sync_directory(&self.dir).map_err(|e| {
            EngineError::io(&self.dir, "Failed to sync directory after compaction", e)
        })?;

        self.segment_list.lock().retain(|seq| !old_segments.contains(seq));
        self.total_bytes.store(compacted_bytes, Ordering::Relaxed);
        self.compactions.fetch_add(1, Ordering::Relaxed);

        let result = CompactionResult {
            segments_removed: old_segments.len(),
            live_entries,
            original_bytes,
            compacted_bytes,
        };
        info!(
            target: "lodestore::compaction",
            segments_removed = result.segments_removed,
            live_entries,
            original_bytes,
            compacted_bytes,
            "Compaction finished"
        );
        Ok(result)
    }

    /// Append one frame of copied pairs and repoint their keys. Returns frame size.
    fn write_compacted(&self, writer: &mut SegmentWriter, ops: &[BatchOp]) -> EngineResult<u64> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let frame = encode_batch(sequence, ops);
        let previous_segment = writer.sequence();
        let (segment, frame_offset) = writer.append_frame(&frame.bytes)?;
        if segment != previous_segment {
            self.segment_list.lock().push(segment);
        }

        let mut keydir = self.keydir.write();
        for (op, value_offset) in ops.iter().zip(&frame.value_offsets) {
            keydir.apply_put(
                &op.key,
                ValuePointer {
                    segment,
                    offset: frame_offset + value_offset,
                    len: op.value.len() as u32,
                },
            );
        }
        Ok(frame.bytes.len() as u64)
    }
}
