//! Chunk codec.
//!
//! A chunk is one opcode-tagged record of an operation. Its payload is a plain
//! sequence of fields with no names or type tags: the decoder must read fields in
//! exactly the order the encoder wrote them. All integers are little-endian.
//! Dynamically sized arrays carry a u32 element count in front of the elements,
//! fixed arrays carry nothing.

use crate::error::CodecError;
use crate::id::{ResourceId, ResourceKind};
use crate::opcode::ChunkType;

/// Size of the per-chunk frame header: opcode(4) + length(4).
pub const CHUNK_HEADER_SIZE: usize = 8;

/// One serialized operation. Deliberately not `Clone`: a chunk is moved into
/// exactly one container and owned there.
#[derive(Debug, PartialEq, Eq)]
pub struct Chunk {
    opcode: u32,
    payload: Vec<u8>,
}

impl Chunk {
    /// Wrap an already encoded payload. Used when reading streams, including
    /// chunks whose opcode this build does not know.
    pub fn from_raw(opcode: u32, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    pub fn chunk_type(&self) -> Option<ChunkType> {
        ChunkType::from_raw(self.opcode)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Size of the chunk once framed into a stream.
    pub fn encoded_len(&self) -> usize {
        CHUNK_HEADER_SIZE + self.payload.len()
    }

    /// Append the framed chunk (opcode, length, payload) to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.opcode.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
    }

    pub fn reader(&self) -> ChunkReader<'_> {
        ChunkReader::new(&self.payload)
    }

    /// Reader that first checks the chunk carries the expected opcode.
    pub fn expect(&self, ty: ChunkType) -> Result<ChunkReader<'_>, CodecError> {
        if self.opcode != ty.opcode() {
            return Err(CodecError::OpcodeMismatch {
                expected: ty.opcode(),
                found: self.opcode,
            });
        }
        Ok(self.reader())
    }
}

/// A type that can be written to and read back from a chunk payload.
pub trait Wire: Sized {
    /// Smallest number of payload bytes one value occupies. Bounds array
    /// allocation when decoding untrusted counts.
    const MIN_WIRE_SIZE: usize;

    fn put(&self, w: &mut ChunkWriter);
    fn get(r: &mut ChunkReader<'_>) -> Result<Self, CodecError>;
}

macro_rules! wire_le {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Wire for $ty {
                const MIN_WIRE_SIZE: usize = std::mem::size_of::<$ty>();

                fn put(&self, w: &mut ChunkWriter) {
                    w.raw(&self.to_le_bytes());
                }

                fn get(r: &mut ChunkReader<'_>) -> Result<Self, CodecError> {
                    let bytes = r.take(std::mem::size_of::<$ty>())?;
                    let mut arr = [0u8; std::mem::size_of::<$ty>()];
                    arr.copy_from_slice(bytes);
                    Ok(<$ty>::from_le_bytes(arr))
                }
            }
        )*
    };
}

wire_le!(u8, u16, u32, i32, u64, i64, f32);

impl Wire for bool {
    const MIN_WIRE_SIZE: usize = 1;

    fn put(&self, w: &mut ChunkWriter) {
        w.raw(&[*self as u8]);
    }

    fn get(r: &mut ChunkReader<'_>) -> Result<Self, CodecError> {
        match u8::get(r)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }
}

impl Wire for ResourceId {
    const MIN_WIRE_SIZE: usize = 8;

    fn put(&self, w: &mut ChunkWriter) {
        self.0.put(w);
    }

    fn get(r: &mut ChunkReader<'_>) -> Result<Self, CodecError> {
        Ok(ResourceId(u64::get(r)?))
    }
}

impl Wire for ResourceKind {
    const MIN_WIRE_SIZE: usize = 4;

    fn put(&self, w: &mut ChunkWriter) {
        self.as_raw().put(w);
    }

    fn get(r: &mut ChunkReader<'_>) -> Result<Self, CodecError> {
        let raw = u32::get(r)?;
        ResourceKind::from_raw(raw).ok_or(CodecError::InvalidKind(raw))
    }
}

impl Wire for String {
    const MIN_WIRE_SIZE: usize = 4;

    fn put(&self, w: &mut ChunkWriter) {
        w.blob(self.as_bytes());
    }

    fn get(r: &mut ChunkReader<'_>) -> Result<Self, CodecError> {
        let bytes = r.blob()?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }
}

/// Fixed arrays: no count on the wire, both sides know N.
impl<T: Wire, const N: usize> Wire for [T; N] {
    const MIN_WIRE_SIZE: usize = T::MIN_WIRE_SIZE * N;

    fn put(&self, w: &mut ChunkWriter) {
        for item in self {
            item.put(w);
        }
    }

    fn get(r: &mut ChunkReader<'_>) -> Result<Self, CodecError> {
        let items = (0..N).map(|_| T::get(r)).collect::<Result<Vec<T>, _>>()?;
        items.try_into().map_err(|rest: Vec<T>| CodecError::Truncated {
            needed: N,
            remaining: rest.len(),
        })
    }
}

/// Dynamic arrays: u32 element count first.
impl<T: Wire> Wire for Vec<T> {
    const MIN_WIRE_SIZE: usize = 4;

    fn put(&self, w: &mut ChunkWriter) {
        (self.len() as u32).put(w);
        for item in self {
            item.put(w);
        }
    }

    fn get(r: &mut ChunkReader<'_>) -> Result<Self, CodecError> {
        let count = u32::get(r)?;
        r.check_array(count, T::MIN_WIRE_SIZE)?;
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(T::get(r)?);
        }
        Ok(items)
    }
}

/// Builds one chunk field by field.
pub struct ChunkWriter {
    opcode: u32,
    buf: Vec<u8>,
}

impl ChunkWriter {
    pub fn new(ty: ChunkType) -> Self {
        Self::with_opcode(ty.opcode())
    }

    /// Writer for an arbitrary opcode, including ones not in the catalog.
    pub fn with_opcode(opcode: u32) -> Self {
        Self {
            opcode,
            buf: Vec::new(),
        }
    }

    pub fn put<T: Wire>(&mut self, value: &T) -> &mut Self {
        value.put(self);
        self
    }

    /// Length-prefixed byte array, copied in one go.
    pub fn blob(&mut self, bytes: &[u8]) -> &mut Self {
        (bytes.len() as u32).put(self);
        self.raw(bytes);
        self
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn finish(self) -> Chunk {
        Chunk {
            opcode: self.opcode,
            payload: self.buf,
        }
    }
}

/// Reads fields back out of a chunk payload, in write order.
pub struct ChunkReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ChunkReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn get<T: Wire>(&mut self) -> Result<T, CodecError> {
        T::get(self)
    }

    pub fn blob(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = u32::get(self)?;
        self.check_array(len, 1)?;
        Ok(self.take(len as usize)?.to_vec())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Succeeds only if every payload byte was consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn check_array(&self, count: u32, min_size: usize) -> Result<(), CodecError> {
        let needed = (count as usize).saturating_mul(min_size);
        if needed > self.remaining() {
            return Err(CodecError::ArrayTooLong {
                count,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }
}
