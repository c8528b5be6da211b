/// Field-level decode failures inside one chunk payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated field: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("{0} trailing bytes after last field")]
    TrailingBytes(usize),

    #[error("invalid bool value: {0}")]
    InvalidBool(u8),

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("array of {count} elements does not fit in {remaining} bytes")]
    ArrayTooLong { count: u32, remaining: usize },

    #[error("invalid resource kind: {0}")]
    InvalidKind(u32),

    #[error("opcode mismatch: expected {expected:#06x}, found {found:#06x}")]
    OpcodeMismatch { expected: u32, found: u32 },

    #[error("unknown opcode: {0:#06x}")]
    UnknownOpcode(u32),

    #[error("opcode {0:#06x} is not a call")]
    NotACall(u32),
}

/// Framing failures of a capture stream.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("invalid magic bytes")]
    InvalidMagic,

    #[error("unsupported capture version: {0}")]
    UnsupportedVersion(u32),

    #[error("truncated stream at offset {offset}")]
    Truncated { offset: u64 },

    #[error("chunk {opcode:#06x} at offset {offset} declares {length} bytes, limit is {limit}")]
    ChunkTooLarge {
        opcode: u32,
        offset: u64,
        length: u32,
        limit: u32,
    },

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("decompression error: {0}")]
    DecompressionError(String),
}
