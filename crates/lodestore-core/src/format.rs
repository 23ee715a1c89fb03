//! Binary format definitions for segment frames
//!
//! A segment is a sequence of frames. Each frame carries one committed batch:
//!
//! FrameHeader (16 bytes) + sequence(u64) + op_count(u32) + ops
//!
//! Each op is: operation(u8) + reserved(u8) + key_len(u16) + value_len(u32) + key + value
//!
//! The CRC32C in the header covers the whole payload, so a batch is either
//! fully readable or rejected as a unit.

/// Magic bytes identifying a frame start: "LODE" in ASCII
pub const MAGIC_ARRAY: [u8; 4] = [0x4C, 0x4F, 0x44, 0x45];

/// Current frame format version
pub const FORMAT_VERSION: u8 = 1;

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Batch preamble inside the payload: sequence(8) + op_count(4)
pub const BATCH_PREAMBLE_SIZE: usize = 12;

/// Per-op header inside the payload
pub const OP_HEADER_SIZE: usize = 8;

/// Batch operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Operation {
    /// Insert or replace a key-value pair
    Put = 1,
    /// Delete a key
    Delete = 2,
}

impl Operation {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Operation::Put),
            2 => Some(Operation::Delete),
            _ => None,
        }
    }
}

/// An operation staged in a write transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOp {
    pub operation: Operation,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl BatchOp {
    pub fn put(key: &[u8], value: &[u8]) -> Self {
        Self {
            operation: Operation::Put,
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    pub fn delete(key: &[u8]) -> Self {
        Self {
            operation: Operation::Delete,
            key: key.to_vec(),
            value: Vec::new(),
        }
    }

    /// Bytes this op occupies inside a payload.
    pub fn encoded_len(&self) -> usize {
        OP_HEADER_SIZE + self.key.len() + self.value.len()
    }
}

/// Fixed-size frame header
///
/// Layout:
///   [0..4]   magic:    [u8;4] - "LODE"
///   [4..8]   length:   u32 LE - payload length in bytes
///   [8..12]  checksum: u32 LE - CRC32C of payload bytes
///   [12]     version:  u8
///   [13..16] reserved: [u8;3]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub version: u8,
}

impl FrameHeader {
    pub fn new(length: u32, checksum: u32) -> Self {
        Self {
            magic: MAGIC_ARRAY,
            length,
            checksum,
            version: FORMAT_VERSION,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.version;
        buf
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        Self {
            magic,
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            version: bytes[12],
        }
    }
}

/// An encoded frame plus where each op's value landed inside it.
#[derive(Debug)]
pub struct EncodedFrame {
    pub bytes: Vec<u8>,
    /// Offset of each op's value bytes, relative to the frame start
    pub value_offsets: Vec<u64>,
}

/// Encode a batch into a complete frame (header + payload).
///
/// Size limits are enforced when ops are staged, not here.
pub fn encode_batch(sequence: u64, ops: &[BatchOp]) -> EncodedFrame {
    let ops_len: usize = ops.iter().map(BatchOp::encoded_len).sum();
    let payload_len = BATCH_PREAMBLE_SIZE + ops_len;

    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload_len);
    bytes.extend_from_slice(&[0u8; HEADER_SIZE]);
    bytes.extend_from_slice(&sequence.to_le_bytes());
    bytes.extend_from_slice(&(ops.len() as u32).to_le_bytes());

    let mut value_offsets = Vec::with_capacity(ops.len());
    for op in ops {
        bytes.push(op.operation as u8);
        bytes.push(0);
        bytes.extend_from_slice(&(op.key.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&(op.value.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&op.key);
        value_offsets.push(bytes.len() as u64);
        bytes.extend_from_slice(&op.value);
    }

    let checksum = crc32c::crc32c(&bytes[HEADER_SIZE..]);
    let header = FrameHeader::new(payload_len as u32, checksum);
    bytes[..HEADER_SIZE].copy_from_slice(&header.to_bytes());

    EncodedFrame {
        bytes,
        value_offsets,
    }
}

/// One op decoded from a payload, borrowing the payload buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedOp<'a> {
    pub operation: Operation,
    pub key: &'a [u8],
    pub value: &'a [u8],
    /// Offset of `value` relative to the frame start
    pub value_offset: u64,
}

/// A decoded batch payload.
#[derive(Debug)]
pub struct DecodedBatch<'a> {
    pub sequence: u64,
    pub ops: Vec<DecodedOp<'a>>,
}

/// Decode a checksum-verified payload. Errors describe the malformed field.
pub fn decode_batch(payload: &[u8]) -> Result<DecodedBatch<'_>, String> {
    if payload.len() < BATCH_PREAMBLE_SIZE {
        return Err(format!("payload too short: {} bytes", payload.len()));
    }

    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&payload[0..8]);
    let sequence = u64::from_le_bytes(seq_bytes);
    let op_count = u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]) as usize;

    let mut ops = Vec::with_capacity(op_count.min(payload.len() / OP_HEADER_SIZE));
    let mut pos = BATCH_PREAMBLE_SIZE;

    for index in 0..op_count {
        if pos + OP_HEADER_SIZE > payload.len() {
            return Err(format!("op {} header runs past payload end", index));
        }
        let operation = Operation::from_byte(payload[pos])
            .ok_or_else(|| format!("op {} has invalid operation type {}", index, payload[pos]))?;
        let key_len = u16::from_le_bytes([payload[pos + 2], payload[pos + 3]]) as usize;
        let value_len = u32::from_le_bytes([
            payload[pos + 4], payload[pos + 5], payload[pos + 6], payload[pos + 7],
        ]) as usize;

        let key_start = pos + OP_HEADER_SIZE;
        let value_start = key_start + key_len;
        let value_end = value_start + value_len;
        if value_end > payload.len() {
            return Err(format!(
                "op {} needs {} bytes for key({}) + value({}), payload has {}",
                index, value_end, key_len, value_len, payload.len()
            ));
        }

        ops.push(DecodedOp {
            operation,
            key: &payload[key_start..value_start],
            value: &payload[value_start..value_end],
            value_offset: (HEADER_SIZE + value_start) as u64,
        });
        pos = value_end;
    }

    if pos != payload.len() {
        return Err(format!("{} trailing bytes after {} ops", payload.len() - pos, op_count));
    }

    Ok(DecodedBatch { sequence, ops })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bytes() {
        let header = FrameHeader::new(42, 0xDEADBEEF);
        let parsed = FrameHeader::from_bytes(&header.to_bytes());
        assert_eq!(parsed, header);
        assert_eq!(parsed.magic, MAGIC_ARRAY);
        assert_eq!(parsed.version, FORMAT_VERSION);
    }

    #[test]
    fn test_encode_decode_mixed_batch() {
        let ops = vec![
            BatchOp::put(b"user:1", br#"{"id":"1"}"#),
            BatchOp::delete(b"user:2"),
            BatchOp::put(b"user:3", b""),
        ];
        let frame = encode_batch(7, &ops);
        let header = FrameHeader::from_bytes(frame.bytes[..HEADER_SIZE].try_into().unwrap());
        assert_eq!(header.length as usize, frame.bytes.len() - HEADER_SIZE);
        assert_eq!(header.checksum, crc32c::crc32c(&frame.bytes[HEADER_SIZE..]));

        let batch = decode_batch(&frame.bytes[HEADER_SIZE..]).unwrap();
        assert_eq!(batch.sequence, 7);
        assert_eq!(batch.ops.len(), 3);
        assert_eq!(batch.ops[0].key, b"user:1");
        assert_eq!(batch.ops[0].value, br#"{"id":"1"}"#);
        assert_eq!(batch.ops[1].operation, Operation::Delete);
        assert!(batch.ops[1].value.is_empty());

        // value offsets point at the value bytes inside the frame
        for (op, offset) in batch.ops.iter().zip(&frame.value_offsets) {
            assert_eq!(op.value_offset, *offset);
            let start = *offset as usize;
            assert_eq!(&frame.bytes[start..start + op.value.len()], op.value);
        }
    }

    #[test]
    fn test_decode_rejects_bad_operation() {
        let mut frame = encode_batch(1, &[BatchOp::put(b"k", b"v")]);
        frame.bytes[HEADER_SIZE + BATCH_PREAMBLE_SIZE] = 9;
        let err = decode_batch(&frame.bytes[HEADER_SIZE..]).unwrap_err();
        assert!(err.contains("invalid operation type"));
    }

    #[test]
    fn test_decode_rejects_truncated_op() {
        let frame = encode_batch(1, &[BatchOp::put(b"key", b"value")]);
        let payload = &frame.bytes[HEADER_SIZE..frame.bytes.len() - 2];
        assert!(decode_batch(payload).is_err());
    }

    #[test]
    fn test_empty_batch() {
        let frame = encode_batch(3, &[]);
        let batch = decode_batch(&frame.bytes[HEADER_SIZE..]).unwrap();
        assert_eq!(batch.sequence, 3);
        assert!(batch.ops.is_empty());
    }
}
