use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A stable, capture-wide identifier for a GPU resource.
/// Minted when the resource is first observed and valid across capture and replay.
/// Never equal to a native handle value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

impl ResourceId {
    /// The null id. Stands for "no resource" or the default object of a binding point.
    pub const fn null() -> Self {
        Self(0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId::{}", self.0)
    }
}

/// Identifies one native context (or share group) inside a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ContextId(pub u32);

/// A native resource handle, meaningful only inside the process instance that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LiveHandle {
    /// Which native context owns the name
    pub context: ContextId,
    /// Type tag, native names are only unique per kind
    pub kind: ResourceKind,
    /// The native name as handed out by the driver
    pub name: u64,
}

impl LiveHandle {
    pub fn new(context: ContextId, kind: ResourceKind, name: u64) -> Self {
        Self { context, kind, name }
    }
}

impl fmt::Display for LiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})@ctx{}", self.kind, self.name, self.context.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResourceKind {
    Device = 0,
    Texture = 1,
    Renderbuffer = 2,
    Framebuffer = 3,
    Buffer = 4,
}

impl ResourceKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Device),
            1 => Some(Self::Texture),
            2 => Some(Self::Renderbuffer),
            3 => Some(Self::Framebuffer),
            4 => Some(Self::Buffer),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Resources that can be attached to a framebuffer.
    pub fn is_attachable(self) -> bool {
        matches!(self, Self::Texture | Self::Renderbuffer)
    }
}

/// Mints logical ids. Shared by every context of a capture so ids stay unique
/// across contexts.
pub struct IdAllocator {
    next_id: AtomicU64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self {
            // 0 is the null id
            next_id: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self) -> ResourceId {
        ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Make sure future ids never collide with ids read back from a capture.
    pub fn reserve_through(&self, id: ResourceId) {
        self.next_id.fetch_max(id.0.saturating_add(1), Ordering::Relaxed);
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
