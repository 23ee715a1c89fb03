//! Segment files: append-only logs of batch frames
//!
//! Segments are named `seg-{sequence:016x}.lode` so lexicographic order is
//! replay order. Only the newest segment is ever appended to.
//!
//! WRITE ORDERING for one commit:
//! 1. rotate if the frame would push the segment past its size limit
//! 2. append the whole frame with a single write
//! 3. durable_sync the segment
//! 4. only then may the caller publish the new value locations

use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::format::{FrameHeader, HEADER_SIZE, MAGIC_ARRAY};
use crate::platform_durability::{durable_sync, sync_directory};

const SEGMENT_PREFIX: &str = "seg-";
const SEGMENT_SUFFIX: &str = ".lode";

/// File name for a segment sequence number.
pub fn segment_file_name(sequence: u64) -> String {
    format!("{}{:016x}{}", SEGMENT_PREFIX, sequence, SEGMENT_SUFFIX)
}

/// Parse a segment sequence number out of a file name.
pub fn parse_segment_name(name: &str) -> Option<u64> {
    let hex = name.strip_prefix(SEGMENT_PREFIX)?.strip_suffix(SEGMENT_SUFFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

/// All segments in `dir`, sorted by sequence.
pub fn list_segments(dir: &Path) -> EngineResult<Vec<(u64, PathBuf)>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| EngineError::io(dir, "Failed to read engine directory", e))?;

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::io(dir, "Failed to read directory entry", e))?;
        let name = entry.file_name();
        if let Some(sequence) = name.to_str().and_then(parse_segment_name) {
            segments.push((sequence, entry.path()));
        }
    }
    segments.sort_by_key(|(sequence, _)| *sequence);
    Ok(segments)
}

/// Appends frames to the newest segment, rotating by size.
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    size: u64,
    dir: PathBuf,
    sequence: u64,
    rotation_size: u64,
}

impl SegmentWriter {
    /// Open (or create) segment `sequence` in `dir` for appending.
    pub fn open(dir: &Path, sequence: u64, rotation_size: u64) -> EngineResult<Self> {
        let path = dir.join(segment_file_name(sequence));
        let created = !path.exists();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EngineError::io(&path, "Failed to open segment", e))?;

        let size = file
            .metadata()
            .map_err(|e| EngineError::io(&path, "Failed to stat segment", e))?
            .len();

        if created {
            sync_directory(dir).map_err(|e| EngineError::io(dir, "Failed to sync directory", e))?;
        }

        Ok(Self {
            file,
            path,
            size,
            dir: dir.to_path_buf(),
            sequence,
            rotation_size,
        })
    }

    /// Append one frame durably. Returns `(segment sequence, frame offset)`.
    ///
    /// On a failed write the segment is truncated back to its previous length
    /// so a half-written frame never sits in front of later frames.
    pub fn append_frame(&mut self, frame: &[u8]) -> EngineResult<(u64, u64)> {
        if self.size > 0 && self.size + frame.len() as u64 > self.rotation_size {
            self.rotate()?;
        }

        let offset = self.size;
        if let Err(e) = self.file.write_all(frame) {
            let _ = self.file.set_len(offset);
            return Err(EngineError::io(&self.path, "Segment write failed", e));
        }

        durable_sync(&self.file)
            .map_err(|e| EngineError::io(&self.path, "Segment durable_sync failed", e))?;

        self.size += frame.len() as u64;
        Ok((self.sequence, offset))
    }

    /// Rotate to a new segment. Syncs the current file before switching.
    pub fn rotate(&mut self) -> EngineResult<()> {
        durable_sync(&self.file)
            .map_err(|e| EngineError::io(&self.path, "Segment sync before rotation failed", e))?;

        let next = Self::open(&self.dir, self.sequence + 1, self.rotation_size)?;
        debug!(
            target: "lodestore::engine",
            from = self.sequence,
            to = next.sequence,
            "Rotated segment"
        );
        *self = next;
        Ok(())
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A checksum-verified frame read from a segment.
#[derive(Debug)]
pub struct Frame {
    /// Offset of the frame header within the segment
    pub offset: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Total bytes the frame occupies on disk.
    pub fn len(&self) -> u64 {
        (HEADER_SIZE + self.payload.len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Result of reading the next frame.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// The segment ends inside a frame starting at `offset`
    Torn { offset: u64 },
    End,
}

/// Sequential frame reader over one segment.
pub struct SegmentReader {
    reader: BufReader<File>,
    path: PathBuf,
    offset: u64,
    len: u64,
}

impl SegmentReader {
    pub fn open(path: &Path) -> EngineResult<Self> {
        let file = File::open(path)
            .map_err(|e| EngineError::io(path, "Failed to open segment for reading", e))?;
        let len = file
            .metadata()
            .map_err(|e| EngineError::io(path, "Failed to stat segment", e))?
            .len();
        Ok(Self {
            reader: BufReader::with_capacity(256 * 1024, file),
            path: path.to_path_buf(),
            offset: 0,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Segment length observed at open.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read and verify the next frame.
    ///
    /// A frame cut short by the end of the file, or whose checksum fails while
    /// it is the final frame, is reported as `Torn`: that is what an
    /// interrupted append looks like. Damage anywhere else is an error.
    pub fn next_frame(&mut self) -> EngineResult<ReadOutcome> {
        if self.offset >= self.len {
            return Ok(ReadOutcome::End);
        }
        let offset = self.offset;
        if self.len - offset < HEADER_SIZE as u64 {
            return Ok(ReadOutcome::Torn { offset });
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        self.read_exact_at_cursor(&mut header_bytes)?;
        let header = FrameHeader::from_bytes(&header_bytes);

        if header.magic != MAGIC_ARRAY {
            return Err(EngineError::Corrupted {
                path: self.path.clone(),
                offset,
                reason: format!("bad magic {:02x?}", header.magic),
            });
        }

        let frame_end = offset + HEADER_SIZE as u64 + header.length as u64;
        if frame_end > self.len {
            return Ok(ReadOutcome::Torn { offset });
        }

        let mut payload = vec![0u8; header.length as usize];
        self.read_exact_at_cursor(&mut payload)?;

        let actual = crc32c::crc32c(&payload);
        if actual != header.checksum {
            if frame_end == self.len {
                return Ok(ReadOutcome::Torn { offset });
            }
            return Err(EngineError::ChecksumMismatch {
                path: self.path.clone(),
                offset,
                expected: header.checksum,
                actual,
            });
        }

        self.offset = frame_end;
        Ok(ReadOutcome::Frame(Frame { offset, payload }))
    }

    fn read_exact_at_cursor(&mut self, buf: &mut [u8]) -> EngineResult<()> {
        self.reader.read_exact(buf).map_err(|e| {
            let message = format!("Failed to read frame at offset {}", self.offset);
            EngineError::io(&self.path, message, e)
        })
    }
}

/// Cut a segment back to `len` bytes, dropping an interrupted tail frame.
pub fn truncate_segment(path: &Path, len: u64) -> EngineResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| EngineError::io(path, "Failed to open segment for truncation", e))?;
    file.set_len(len)
        .map_err(|e| EngineError::io(path, "Failed to truncate segment", e))?;
    durable_sync(&file).map_err(|e| EngineError::io(path, "Failed to sync truncated segment", e))?;
    warn!(
        target: "lodestore::engine",
        path = %path.display(),
        len,
        "Truncated interrupted frame at segment tail"
    );
    Ok(())
}

/// Read `len` bytes at `offset` from a segment.
pub fn read_at(path: &Path, offset: u64, len: usize) -> EngineResult<Vec<u8>> {
    let mut file =
        File::open(path).map_err(|e| EngineError::io(path, "Failed to open segment", e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| EngineError::io(path, format!("Failed to seek to offset {}", offset), e))?;

    let mut buf = vec![0u8; len];
    file.read_exact(&mut buf).map_err(|e| {
        let reason = if e.kind() == ErrorKind::UnexpectedEof {
            "short read"
        } else {
            "read failed"
        };
        EngineError::io(path, format!("Value {} at offset {}", reason, offset), e)
    })?;
    Ok(buf)
}
