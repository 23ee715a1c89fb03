//! Core storage engine
//!
//! `Engine` is a log-structured key-value store: committed batches are
//! appended to segment files and an in-memory key directory maps every live
//! key to the location of its newest value on disk.
//!
//! **Write path**: one exclusive `WriteTxn` at a time, one frame per commit
//! **Read path**: key directory lookup, then a positioned read of the value
//! **Startup**: replay every segment in order to rebuild the key directory

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tracing::info;

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::format::{decode_batch, Operation, OP_HEADER_SIZE};
use crate::segment::{self, ReadOutcome, SegmentReader, SegmentWriter};
use crate::txn::WriteTxn;

/// Where the newest value of a key lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValuePointer {
    pub segment: u64,
    /// Offset of the value bytes within the segment
    pub offset: u64,
    pub len: u32,
}

/// Key directory plus the byte count of the entries it references.
#[derive(Debug, Default)]
pub(crate) struct KeyDir {
    pub(crate) entries: HashMap<Vec<u8>, ValuePointer>,
    pub(crate) live_bytes: u64,
}

impl KeyDir {
    pub(crate) fn apply_put(&mut self, key: &[u8], pointer: ValuePointer) {
        let size = entry_size(key.len(), pointer.len as usize);
        if let Some(old) = self.entries.insert(key.to_vec(), pointer) {
            let freed = entry_size(key.len(), old.len as usize);
            self.live_bytes = self.live_bytes.saturating_sub(freed);
        }
        self.live_bytes += size;
    }

    pub(crate) fn apply_delete(&mut self, key: &[u8]) {
        if let Some(old) = self.entries.remove(key) {
            let freed = entry_size(key.len(), old.len as usize);
            self.live_bytes = self.live_bytes.saturating_sub(freed);
        }
    }
}

pub(crate) fn entry_size(key_len: usize, value_len: usize) -> u64 {
    (OP_HEADER_SIZE + key_len + value_len) as u64
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EngineStats {
    pub keys: usize,
    pub segments: usize,
    /// Bytes across all segment files
    pub total_bytes: u64,
    /// Bytes still referenced by the key directory
    pub live_bytes: u64,
    pub commits: u64,
    pub compactions: u64,
}

impl EngineStats {
    /// Fraction of on-disk bytes no longer referenced (0.0 = none).
    pub fn dead_ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.total_bytes.saturating_sub(self.live_bytes) as f64 / self.total_bytes as f64
    }
}

/// Embedded durable key-value engine.
///
/// All public methods take `&self`. Readers proceed concurrently; writers
/// serialize through the writer mutex held by a `WriteTxn`. Compaction takes
/// the segment lock exclusively, so scans and reads never see a segment
/// disappear under them.
pub struct Engine {
    pub(crate) dir: PathBuf,
    pub(crate) config: EngineConfig,
    pub(crate) writer: Mutex<SegmentWriter>,
    pub(crate) keydir: RwLock<KeyDir>,
    /// Shared while reading segment files, exclusive while compaction rewrites them
    pub(crate) segment_guard: RwLock<()>,
    pub(crate) segment_list: Mutex<Vec<u64>>,
    pub(crate) next_sequence: AtomicU64,
    pub(crate) total_bytes: AtomicU64,
    pub(crate) commits: AtomicU64,
    pub(crate) compactions: AtomicU64,
}

impl Engine {
    /// Open or create an engine in `dir`.
    ///
    /// Replays every segment to rebuild the key directory. An interrupted frame
    /// at the tail of the newest segment is truncated; any other damage fails
    /// the open.
    pub fn open<P: AsRef<Path>>(dir: P, config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| EngineError::io(&dir, "Failed to create engine directory", e))?;

        let segments = segment::list_segments(&dir)?;
        let mut keydir = KeyDir::default();
        let mut total_bytes = 0u64;
        let mut max_sequence = 0u64;
        let mut frames = 0u64;

        for (index, (segment_seq, path)) in segments.iter().enumerate() {
            let newest = index + 1 == segments.len();
            let mut reader = SegmentReader::open(path)?;
            let mut segment_len = reader.len();

            loop {
                match reader.next_frame()? {
                    ReadOutcome::Frame(frame) => {
                        let batch = decode_batch(&frame.payload).map_err(|reason| {
                            EngineError::Corrupted {
                                path: path.clone(),
                                offset: frame.offset,
                                reason,
                            }
                        })?;
                        max_sequence = max_sequence.max(batch.sequence);
                        for op in &batch.ops {
                            match op.operation {
                                Operation::Put => keydir.apply_put(
                                    op.key,
                                    ValuePointer {
                                        segment: *segment_seq,
                                        offset: frame.offset + op.value_offset,
                                        len: op.value.len() as u32,
                                    },
                                ),
                                Operation::Delete => keydir.apply_delete(op.key),
                            }
                        }
                        frames += 1;
                    }
                    ReadOutcome::Torn { offset } if newest => {
                        segment::truncate_segment(path, offset)?;
                        segment_len = offset;
                        break;
                    }
                    ReadOutcome::Torn { offset } => {
                        return Err(EngineError::Corrupted {
                            path: path.clone(),
                            offset,
                            reason: "incomplete frame in a sealed segment".to_string(),
                        });
                    }
                    ReadOutcome::End => break,
                }
            }
            total_bytes += segment_len;
        }

        let active = segments.last().map(|(seq, _)| *seq).unwrap_or(1);
        let writer = SegmentWriter::open(&dir, active, config.segment_size_bytes)?;
        let mut segment_list: Vec<u64> = segments.iter().map(|(seq, _)| *seq).collect();
        if segment_list.last() != Some(&active) {
            segment_list.push(active);
        }

        if frames > 0 {
            info!(
                target: "lodestore::engine",
                path = %dir.display(),
                keys = keydir.entries.len(),
                frames,
                segments = segment_list.len(),
                "Recovered engine state"
            );
        }

        Ok(Self {
            dir,
            config,
            writer: Mutex::new(writer),
            keydir: RwLock::new(keydir),
            segment_guard: RwLock::new(()),
            segment_list: Mutex::new(segment_list),
            next_sequence: AtomicU64::new(max_sequence + 1),
            total_bytes: AtomicU64::new(total_bytes),
            commits: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
        })
    }

    /// Begin an exclusive write transaction. Blocks while another is open.
    pub fn begin_write(&self) -> WriteTxn<'_> {
        WriteTxn::new(self, self.writer.lock())
    }

    /// Read the committed value for `key`.
    pub fn get(&self, key: &[u8]) -> EngineResult<Option<Vec<u8>>> {
        let _guard = self.segment_guard.read_recursive();
        let pointer = match self.keydir.read().entries.get(key) {
            Some(pointer) => *pointer,
            None => return Ok(None),
        };
        let path = self.segment_path(pointer.segment);
        segment::read_at(&path, pointer.offset, pointer.len as usize).map(Some)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.keydir.read().entries.contains_key(key)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.keydir.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keydir.read().entries.is_empty()
    }

    /// Engine directory.
    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        let (keys, live_bytes) = {
            let keydir = self.keydir.read();
            (keydir.entries.len(), keydir.live_bytes)
        };
        EngineStats {
            keys,
            segments: self.segment_list.lock().len(),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            live_bytes,
            commits: self.commits.load(Ordering::Relaxed),
            compactions: self.compactions.load(Ordering::Relaxed),
        }
    }

    /// Lazily iterate every live pair in chunks of at most `chunk_size`.
    ///
    /// Segments are read sequentially. The scan reflects commits made before it
    /// started; keys written while it runs may be missed. Compaction waits for
    /// open scans to finish.
    pub fn scan(&self, chunk_size: usize) -> Scan<'_> {
        let guard = self.segment_guard.read_recursive();
        let segments = self.segment_list.lock().clone();
        Scan {
            _guard: guard,
            live: LiveEntries::new(self, segments),
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }

    pub(crate) fn segment_path(&self, segment: u64) -> PathBuf {
        self.dir.join(segment::segment_file_name(segment))
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("path", &self.dir)
            .field("keys", &self.len())
            .finish()
    }
}

/// Walks segment frames in order and yields pairs the key directory still
/// points at. Takes no segment lock itself; callers hold it.
///
/// Liveness is checked again as each pair is yielded, so a key committed
/// after its frame was decoded is skipped rather than returned stale.
pub(crate) struct LiveEntries<'e> {
    engine: &'e Engine,
    segments: std::vec::IntoIter<u64>,
    current: Option<(u64, SegmentReader)>,
    pending: std::vec::IntoIter<LivePair>,
}

/// A decoded put plus where its value lives.
struct LivePair {
    segment: u64,
    offset: u64,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl LivePair {
    fn is_current(&self, keydir: &KeyDir) -> bool {
        keydir
            .entries
            .get(&self.key)
            .map_or(false, |p| p.segment == self.segment && p.offset == self.offset)
    }
}

impl<'e> LiveEntries<'e> {
    pub(crate) fn new(engine: &'e Engine, segments: Vec<u64>) -> Self {
        Self {
            engine,
            segments: segments.into_iter(),
            current: None,
            pending: Vec::new().into_iter(),
        }
    }

    /// Decode the next frame into `pending`. Returns false when exhausted.
    fn refill(&mut self) -> EngineResult<bool> {
        loop {
            if self.current.is_none() {
                match self.segments.next() {
                    Some(seq) => {
                        let path = self.engine.segment_path(seq);
                        self.current = Some((seq, SegmentReader::open(&path)?));
                    }
                    None => return Ok(false),
                }
            }
            let Some((segment_seq, reader)) = self.current.as_mut() else {
                continue;
            };
            let segment_seq = *segment_seq;

            let frame = match reader.next_frame()? {
                ReadOutcome::Frame(frame) => frame,
                // a frame appended after the reader opened, or a tail being written
                ReadOutcome::Torn { .. } | ReadOutcome::End => {
                    self.current = None;
                    continue;
                }
            };

            let batch = decode_batch(&frame.payload).map_err(|reason| EngineError::Corrupted {
                path: reader.path().to_path_buf(),
                offset: frame.offset,
                reason,
            })?;

            let keydir = self.engine.keydir.read();
            let live: Vec<LivePair> = batch
                .ops
                .iter()
                .filter(|op| op.operation == Operation::Put)
                .map(|op| LivePair {
                    segment: segment_seq,
                    offset: frame.offset + op.value_offset,
                    key: op.key.to_vec(),
                    value: op.value.to_vec(),
                })
                .filter(|pair| pair.is_current(&keydir))
                .collect();
            drop(keydir);

            if !live.is_empty() {
                self.pending = live.into_iter();
                return Ok(true);
            }
        }
    }

    /// Next buffered pair that is still current.
    fn next_buffered(&mut self) -> Option<(Vec<u8>, Vec<u8>)> {
        let keydir = self.engine.keydir.read();
        self.pending
            .by_ref()
            .find(|pair| pair.is_current(&keydir))
            .map(|pair| (pair.key, pair.value))
    }
}

impl Iterator for LiveEntries<'_> {
    type Item = EngineResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(pair) = self.next_buffered() {
                return Some(Ok(pair));
            }
            match self.refill() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Chunked scan over live pairs. See [`Engine::scan`].
pub struct Scan<'e> {
    _guard: RwLockReadGuard<'e, ()>,
    live: LiveEntries<'e>,
    chunk_size: usize,
    done: bool,
}

impl Iterator for Scan<'_> {
    type Item = EngineResult<Vec<(Vec<u8>, Vec<u8>)>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut chunk = Vec::with_capacity(self.chunk_size.min(4096));
        while chunk.len() < self.chunk_size {
            match self.live.next() {
                Some(Ok(pair)) => chunk.push(pair),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if chunk.is_empty() {
            None
        } else {
            Some(Ok(chunk))
        }
    }
}
