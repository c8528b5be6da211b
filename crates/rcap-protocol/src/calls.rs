//! Recorded operations in logical-id form.
//!
//! Interception shims translate every resource-typed argument into a
//! [`ResourceId`] and hand the core a [`Call`]. The field list of each variant is
//! also its wire layout: fields are encoded and decoded in declaration order.

use crate::chunk::{Chunk, ChunkReader, ChunkWriter};
use crate::error::CodecError;
use crate::id::{ResourceId, ResourceKind};
use crate::opcode::{CallScope, ChunkType};

/// Attachment points of a framebuffer.
pub mod attachment {
    pub const COLOR0: u32 = 0x8CE0;
    pub const DEPTH: u32 = 0x8D00;
    pub const STENCIL: u32 = 0x8D20;
    pub const DEPTH_STENCIL: u32 = 0x821A;

    pub fn is_depth_or_stencil(slot: u32) -> bool {
        matches!(slot, DEPTH | STENCIL | DEPTH_STENCIL)
    }
}

/// Framebuffer binding points.
pub mod target {
    pub const READ_FRAMEBUFFER: u32 = 0x8CA8;
    pub const DRAW_FRAMEBUFFER: u32 = 0x8CA9;
    pub const FRAMEBUFFER: u32 = 0x8D40;
    pub const RENDERBUFFER: u32 = 0x8D41;

    /// `FRAMEBUFFER` binds both draw and read.
    pub fn is_draw(target: u32) -> bool {
        target == DRAW_FRAMEBUFFER || target == FRAMEBUFFER
    }
}

/// Collects the logical ids a value refers to, so they can be resolved before a
/// call is reissued.
pub trait CollectIds {
    fn collect_ids(&self, _out: &mut Vec<ResourceId>) {}
}

impl CollectIds for ResourceId {
    fn collect_ids(&self, out: &mut Vec<ResourceId>) {
        if !self.is_null() && !out.contains(self) {
            out.push(*self);
        }
    }
}

impl CollectIds for u8 {}
impl CollectIds for u32 {}
impl CollectIds for i32 {}
impl CollectIds for u64 {}

impl<T: CollectIds> CollectIds for Vec<T> {
    fn collect_ids(&self, out: &mut Vec<ResourceId>) {
        self.iter().for_each(|item| item.collect_ids(out));
    }
}

impl<T: CollectIds, const N: usize> CollectIds for [T; N] {
    fn collect_ids(&self, out: &mut Vec<ResourceId>) {
        self.iter().for_each(|item| item.collect_ids(out));
    }
}

macro_rules! calls {
    ($( $(#[$meta:meta])* $name:ident { $( $field:ident : $ty:ty ),* $(,)? } )*) => {
        #[derive(Debug, Clone, PartialEq)]
        pub enum Call {
            $( $(#[$meta])* $name { $( $field: $ty ),* }, )*
        }

        impl Call {
            pub fn chunk_type(&self) -> ChunkType {
                match self {
                    $( Call::$name { .. } => ChunkType::$name, )*
                }
            }

            /// Serialize the call into a fresh chunk.
            pub fn encode(&self) -> Chunk {
                let mut w = ChunkWriter::new(self.chunk_type());
                match self {
                    $( Call::$name { $( $field ),* } => { $( w.put($field); )* } )*
                }
                w.finish()
            }

            /// Decode a payload of the given chunk type, field for field.
            pub fn decode(chunk_type: ChunkType, payload: &[u8]) -> Result<Self, CodecError> {
                let mut r = ChunkReader::new(payload);
                let call = match chunk_type {
                    $( ChunkType::$name => Call::$name { $( $field: r.get::<$ty>()? ),* }, )*
                    other => return Err(CodecError::NotACall(other.opcode())),
                };
                r.finish()?;
                Ok(call)
            }

            /// Every non-null logical id the call refers to, in field order.
            pub fn resource_ids(&self) -> Vec<ResourceId> {
                let mut out = Vec::new();
                match self {
                    $( Call::$name { $( $field ),* } => { $( $field.collect_ids(&mut out); )* } )*
                }
                out
            }
        }
    };
}

calls! {
    GenTexture { id: ResourceId }
    GenFramebuffer { id: ResourceId }
    GenRenderbuffer { id: ResourceId }
    GenBuffer { id: ResourceId }

    TextureStorage {
        texture: ResourceId,
        target: u32,
        levels: u32,
        internal_format: u32,
        width: u32,
        height: u32,
        depth: u32,
        samples: u32,
    }
    RenderbufferStorage {
        renderbuffer: ResourceId,
        internal_format: u32,
        width: u32,
        height: u32,
    }
    RenderbufferStorageMultisample {
        internal_format: u32,
        samples: u32,
        width: u32,
        height: u32,
        renderbuffer: ResourceId,
    }
    BufferData {
        buffer: ResourceId,
        usage: u32,
        data: Vec<u8>,
    }
    FramebufferParameter {
        pname: u32,
        param: i32,
        framebuffer: ResourceId,
    }
    ReadBuffer {
        mode: u32,
        framebuffer: ResourceId,
    }
    FramebufferDrawBuffers {
        framebuffer: ResourceId,
        buffers: Vec<u32>,
    }

    FramebufferTexture {
        attachment: u32,
        texture: ResourceId,
        level: i32,
        framebuffer: ResourceId,
    }
    FramebufferTexture2D {
        attachment: u32,
        texture: ResourceId,
        textarget: u32,
        level: i32,
        framebuffer: ResourceId,
    }
    FramebufferTexture3D {
        attachment: u32,
        texture: ResourceId,
        textarget: u32,
        level: i32,
        zoffset: i32,
        framebuffer: ResourceId,
    }
    FramebufferTextureLayer {
        attachment: u32,
        texture: ResourceId,
        level: i32,
        layer: i32,
        framebuffer: ResourceId,
    }
    FramebufferRenderbuffer {
        framebuffer: ResourceId,
        attachment: u32,
        renderbuffer_target: u32,
        renderbuffer: ResourceId,
    }

    TextureSubImage {
        texture: ResourceId,
        level: i32,
        offset: [i32; 3],
        extent: [u32; 3],
        format: u32,
        data: Vec<u8>,
    }

    BindFramebuffer {
        target: u32,
        framebuffer: ResourceId,
    }
    DrawBuffer { buffer: u32 }
    /// Source and destination rectangles are (x0, y0, x1, y1).
    BlitFramebuffer {
        src: [i32; 4],
        dst: [i32; 4],
        mask: u32,
        filter: u32,
    }
    Draw {
        mode: u32,
        first: i32,
        count: u32,
    }

    InvalidateFramebuffer {
        framebuffer: ResourceId,
        attachments: Vec<u32>,
    }
    InvalidateTexImage {
        texture: ResourceId,
        level: i32,
    }

    DeleteResource { id: ResourceId }
}

/// A framebuffer attachment carried by an attachment call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attachment {
    pub framebuffer: ResourceId,
    pub slot: u32,
    /// Null when the slot is being detached
    pub resource: ResourceId,
}

impl Call {
    pub fn scope(&self) -> CallScope {
        self.chunk_type().scope()
    }

    /// The creation call for a resource of `kind`. The device has none.
    pub fn creation(kind: ResourceKind, id: ResourceId) -> Option<Self> {
        match kind {
            ResourceKind::Texture => Some(Call::GenTexture { id }),
            ResourceKind::Framebuffer => Some(Call::GenFramebuffer { id }),
            ResourceKind::Renderbuffer => Some(Call::GenRenderbuffer { id }),
            ResourceKind::Buffer => Some(Call::GenBuffer { id }),
            ResourceKind::Device => None,
        }
    }

    /// The resource a creation call brings into existence.
    pub fn created(&self) -> Option<(ResourceId, ResourceKind)> {
        match *self {
            Call::GenTexture { id } => Some((id, ResourceKind::Texture)),
            Call::GenFramebuffer { id } => Some((id, ResourceKind::Framebuffer)),
            Call::GenRenderbuffer { id } => Some((id, ResourceKind::Renderbuffer)),
            Call::GenBuffer { id } => Some((id, ResourceKind::Buffer)),
            _ => None,
        }
    }

    /// The resource whose state the call changes. Null means the default object,
    /// whose state lives in the device record. Frame-only calls have no target.
    pub fn target(&self) -> ResourceId {
        match *self {
            Call::GenTexture { id }
            | Call::GenFramebuffer { id }
            | Call::GenRenderbuffer { id }
            | Call::GenBuffer { id }
            | Call::DeleteResource { id } => id,
            Call::TextureStorage { texture, .. }
            | Call::TextureSubImage { texture, .. }
            | Call::InvalidateTexImage { texture, .. } => texture,
            Call::RenderbufferStorage { renderbuffer, .. }
            | Call::RenderbufferStorageMultisample { renderbuffer, .. } => renderbuffer,
            Call::BufferData { buffer, .. } => buffer,
            Call::FramebufferParameter { framebuffer, .. }
            | Call::ReadBuffer { framebuffer, .. }
            | Call::FramebufferDrawBuffers { framebuffer, .. }
            | Call::FramebufferTexture { framebuffer, .. }
            | Call::FramebufferTexture2D { framebuffer, .. }
            | Call::FramebufferTexture3D { framebuffer, .. }
            | Call::FramebufferTextureLayer { framebuffer, .. }
            | Call::FramebufferRenderbuffer { framebuffer, .. }
            | Call::InvalidateFramebuffer { framebuffer, .. } => framebuffer,
            Call::BindFramebuffer { .. }
            | Call::DrawBuffer { .. }
            | Call::BlitFramebuffer { .. }
            | Call::Draw { .. } => ResourceId::null(),
        }
    }

    pub fn attachment(&self) -> Option<Attachment> {
        let (framebuffer, slot, resource) = match *self {
            Call::FramebufferTexture { framebuffer, attachment, texture, .. }
            | Call::FramebufferTexture2D { framebuffer, attachment, texture, .. }
            | Call::FramebufferTexture3D { framebuffer, attachment, texture, .. }
            | Call::FramebufferTextureLayer { framebuffer, attachment, texture, .. } => {
                (framebuffer, attachment, texture)
            }
            Call::FramebufferRenderbuffer { framebuffer, attachment, renderbuffer, .. } => {
                (framebuffer, attachment, renderbuffer)
            }
            _ => return None,
        };
        Some(Attachment {
            framebuffer,
            slot,
            resource,
        })
    }

    /// Decode a framed chunk back into a call.
    pub fn from_chunk(chunk: &Chunk) -> Result<Self, CodecError> {
        let ty = chunk
            .chunk_type()
            .ok_or(CodecError::UnknownOpcode(chunk.opcode()))?;
        Self::decode(ty, chunk.payload())
    }
}
