//! The chunk type catalog.
//!
//! Every operation class that can appear in a capture stream is declared once in
//! the table below, together with its wire opcode and its static routing
//! classification. The capture state machine only ever looks at the
//! classification; no call decides on its own whether it is recorded.

use std::fmt;

/// Which container a call's chunk flows into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallScope {
    /// Capture file structure, never produced by an intercepted call.
    Structure,
    /// Creates a resource and starts its record.
    Creation,
    /// Changes the state of one resource; appended to that resource's record.
    Resource,
    /// Writes resource contents. Captured through dirty tracking, in frames also verbatim.
    Content,
    /// Not resource-scoped; only meaningful in strict temporal order.
    Frame,
    /// Feeds the dirty tracker and is never serialized.
    Tracking,
    /// Destroys a resource. Never serialized.
    Deletion,
}

macro_rules! chunk_types {
    (@coalesce coalesce) => { true };
    (@coalesce) => { false };
    ($( $(#[$meta:meta])* $name:ident = $opcode:literal, $scope:ident $(, $flag:ident)? ; )*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum ChunkType {
            $( $(#[$meta])* $name = $opcode, )*
        }

        impl ChunkType {
            pub const ALL: &'static [ChunkType] = &[$( ChunkType::$name, )*];

            pub fn from_raw(raw: u32) -> Option<Self> {
                match raw {
                    $( $opcode => Some(Self::$name), )*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$name => stringify!($name), )*
                }
            }

            pub fn scope(self) -> CallScope {
                match self {
                    $( Self::$name => CallScope::$scope, )*
                }
            }

            /// Whether a new chunk of this type may replace an immediately
            /// preceding chunk of the same type in a resource record.
            pub fn coalesces(self) -> bool {
                match self {
                    $( Self::$name => chunk_types!(@coalesce $($flag)?), )*
                }
            }
        }
    };
}

chunk_types! {
    DeviceInit = 0x0001, Structure;
    /// Header of one resource's block: id, kind and number of chunks that follow.
    ResourceBlock = 0x0002, Structure;
    InitialContents = 0x0003, Structure;
    FrameBegin = 0x0004, Structure;
    FrameEnd = 0x0005, Structure;

    GenTexture = 0x0100, Creation;
    GenFramebuffer = 0x0101, Creation;
    GenRenderbuffer = 0x0102, Creation;
    GenBuffer = 0x0103, Creation;

    TextureStorage = 0x0110, Resource;
    RenderbufferStorage = 0x0111, Resource;
    RenderbufferStorageMultisample = 0x0112, Resource;
    BufferData = 0x0113, Resource;
    FramebufferParameter = 0x0114, Resource;
    /// Re-selecting the read target before anything reads is a pure overwrite.
    ReadBuffer = 0x0115, Resource, coalesce;
    FramebufferDrawBuffers = 0x0116, Resource;

    FramebufferTexture = 0x0120, Resource;
    FramebufferTexture2D = 0x0121, Resource;
    FramebufferTexture3D = 0x0122, Resource;
    FramebufferTextureLayer = 0x0123, Resource;
    FramebufferRenderbuffer = 0x0124, Resource;

    TextureSubImage = 0x0130, Content;

    BindFramebuffer = 0x0140, Frame;
    DrawBuffer = 0x0141, Frame;
    BlitFramebuffer = 0x0142, Frame;
    Draw = 0x0143, Frame;

    InvalidateFramebuffer = 0x0150, Tracking;
    InvalidateTexImage = 0x0151, Tracking;

    DeleteResource = 0x0160, Deletion;
}

impl ChunkType {
    pub fn opcode(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Human-readable name for any opcode, including ones this build does not know.
pub fn opcode_name(opcode: u32) -> String {
    match ChunkType::from_raw(opcode) {
        Some(ty) => ty.name().to_string(),
        None => format!("Unknown({:#06x})", opcode),
    }
}
