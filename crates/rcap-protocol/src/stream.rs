use std::borrow::Cow;

use crate::chunk::{Chunk, CHUNK_HEADER_SIZE};
use crate::error::StreamError;
use crate::opcode::ChunkType;

/// Capture file magic bytes: "RC"
pub const MAGIC: [u8; 2] = [0x52, 0x43];

/// Current capture container version.
pub const CAPTURE_VERSION: u32 = 1;

/// File header size in bytes: magic(2) + flags(1) + reserved(1) + version(4) + length(4) = 12
pub const HEADER_SIZE: usize = 12;

/// Maximum payload size: 1 GB
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024 * 1024;

/// Default chunk size limit when reading: 256 MB
pub const DEFAULT_MAX_CHUNK_SIZE: u32 = 256 * 1024 * 1024;

/// Minimum payload size to attempt LZ4 compression (bytes).
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 512;

bitflags::bitflags! {
    /// Capture header flags byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamFlags: u8 {
        const COMPRESSED = 0b0000_0001;
        const HAS_FRAME  = 0b0000_0010;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureHeader {
    pub flags: StreamFlags,
    pub version: u32,
    pub payload_len: u32,
}

/// Wrap a chunk sequence into a capture file (header + payload), compressing the
/// payload with LZ4 when `compression_threshold` is set and it pays off.
pub fn encode_capture(
    payload: &[u8],
    flags: StreamFlags,
    compression_threshold: Option<usize>,
) -> Result<Vec<u8>, StreamError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(StreamError::PayloadTooLarge(payload.len()));
    }

    let mut flags = flags - StreamFlags::COMPRESSED;
    let final_payload: Cow<'_, [u8]> = match compression_threshold {
        Some(threshold) if payload.len() > threshold => {
            let compressed = lz4_flex::compress_prepend_size(payload);
            if compressed.len() < payload.len() {
                flags |= StreamFlags::COMPRESSED;
                Cow::Owned(compressed)
            } else {
                // Compression didn't help, store uncompressed
                Cow::Borrowed(payload)
            }
        }
        _ => Cow::Borrowed(payload),
    };

    let mut out = Vec::with_capacity(HEADER_SIZE + final_payload.len());
    out.extend_from_slice(&MAGIC);
    out.push(flags.bits());
    out.push(0);
    out.extend_from_slice(&CAPTURE_VERSION.to_le_bytes());
    out.extend_from_slice(&(final_payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&final_payload);
    Ok(out)
}

/// Decode a capture file header.
pub fn decode_header(header: &[u8; HEADER_SIZE]) -> Result<CaptureHeader, StreamError> {
    if header[0] != MAGIC[0] || header[1] != MAGIC[1] {
        return Err(StreamError::InvalidMagic);
    }

    let flags = StreamFlags::from_bits_truncate(header[2]);
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let payload_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

    if version != CAPTURE_VERSION {
        return Err(StreamError::UnsupportedVersion(version));
    }
    if payload_len as usize > MAX_PAYLOAD_SIZE {
        return Err(StreamError::PayloadTooLarge(payload_len as usize));
    }

    Ok(CaptureHeader {
        flags,
        version,
        payload_len,
    })
}

/// Split a capture file into its header and the (decompressed) chunk payload.
pub fn decode_capture(bytes: &[u8]) -> Result<(CaptureHeader, Cow<'_, [u8]>), StreamError> {
    let header_bytes: &[u8; HEADER_SIZE] = bytes
        .get(..HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or(StreamError::Truncated { offset: 0 })?;
    let header = decode_header(header_bytes)?;

    let end = HEADER_SIZE + header.payload_len as usize;
    let payload = bytes.get(HEADER_SIZE..end).ok_or(StreamError::Truncated {
        offset: bytes.len() as u64,
    })?;

    let data = if header.flags.contains(StreamFlags::COMPRESSED) {
        // LZ4 stores the decompressed size as a little-endian u32 prefix.
        if let Some(prefix) = payload.get(..4) {
            let size = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
            if size > MAX_PAYLOAD_SIZE {
                return Err(StreamError::PayloadTooLarge(size));
            }
        }
        Cow::Owned(
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| StreamError::DecompressionError(e.to_string()))?,
        )
    } else {
        Cow::Borrowed(payload)
    };
    Ok((header, data))
}

/// One framed chunk as found in a stream, known opcode or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawChunk<'a> {
    pub opcode: u32,
    /// Offset of the chunk header within the payload
    pub offset: u64,
    pub payload: &'a [u8],
}

impl RawChunk<'_> {
    pub fn chunk_type(&self) -> Option<ChunkType> {
        ChunkType::from_raw(self.opcode)
    }

    pub fn to_chunk(&self) -> Chunk {
        Chunk::from_raw(self.opcode, self.payload.to_vec())
    }
}

/// Iterates the framed chunks of a payload. Every chunk is skipped by its declared
/// length, so chunks with unrecognized opcodes never misalign the stream.
pub struct ChunkStream<'a> {
    data: &'a [u8],
    pos: usize,
    max_chunk_size: u32,
    failed: bool,
}

impl<'a> ChunkStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::with_limit(data, DEFAULT_MAX_CHUNK_SIZE)
    }

    pub fn with_limit(data: &'a [u8], max_chunk_size: u32) -> Self {
        Self {
            data,
            pos: 0,
            max_chunk_size,
            failed: false,
        }
    }

    pub fn offset(&self) -> u64 {
        self.pos as u64
    }

    fn next_chunk(&mut self) -> Result<RawChunk<'a>, StreamError> {
        let offset = self.pos as u64;
        let header = self
            .data
            .get(self.pos..self.pos + CHUNK_HEADER_SIZE)
            .ok_or(StreamError::Truncated { offset })?;
        let opcode = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let length = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if length > self.max_chunk_size {
            return Err(StreamError::ChunkTooLarge {
                opcode,
                offset,
                length,
                limit: self.max_chunk_size,
            });
        }

        let start = self.pos + CHUNK_HEADER_SIZE;
        let payload = self
            .data
            .get(start..start + length as usize)
            .ok_or(StreamError::Truncated { offset })?;
        self.pos = start + length as usize;

        Ok(RawChunk {
            opcode,
            offset,
            payload,
        })
    }
}

impl<'a> Iterator for ChunkStream<'a> {
    type Item = Result<RawChunk<'a>, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.data.len() {
            return None;
        }
        let result = self.next_chunk();
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }
}
