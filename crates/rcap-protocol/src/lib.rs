pub mod calls;
pub mod chunk;
pub mod error;
pub mod id;
pub mod opcode;
pub mod stream;

pub use calls::{Attachment, Call};
pub use chunk::{Chunk, ChunkReader, ChunkWriter, Wire};
pub use error::{CodecError, StreamError};
pub use id::{ContextId, IdAllocator, LiveHandle, ResourceId, ResourceKind};
pub use opcode::{CallScope, ChunkType};
