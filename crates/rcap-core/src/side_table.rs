use std::collections::BTreeMap;

use dashmap::DashMap;
use rcap_protocol::calls::attachment;
use rcap_protocol::{Attachment, Call, ResourceId, ResourceKind};
use tracing::trace;

bitflags::bitflags! {
    /// How a texture-like resource has been bound so far.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TextureUsage: u32 {
        const RENDER_TARGET = 0b0001;
        const DEPTH_TARGET  = 0b0010;
        const SAMPLED       = 0b0100;
    }
}

/// Shape and usage of a texture or renderbuffer, as of the latest recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    pub kind: ResourceKind,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub samples: u32,
    pub internal_format: u32,
    /// 1, 2 or 3
    pub dimension: u32,
    pub usage: TextureUsage,
}

impl TextureData {
    fn empty(kind: ResourceKind) -> Self {
        Self {
            kind,
            width: 0,
            height: 0,
            depth: 0,
            samples: 1,
            internal_format: 0,
            dimension: if kind == ResourceKind::Renderbuffer { 2 } else { 0 },
            usage: TextureUsage::empty(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FramebufferData {
    /// Attachment slot -> attached texture or renderbuffer
    pub attachments: BTreeMap<u32, ResourceId>,
}

impl FramebufferData {
    /// Whether any slot references `id`.
    pub fn references(&self, id: ResourceId) -> bool {
        self.attachments.values().any(|r| *r == id)
    }
}

/// Per-resource metadata kept next to the records, keyed by logical id.
/// Shared by every context of a share group.
#[derive(Default)]
pub struct SideTables {
    textures: DashMap<ResourceId, TextureData>,
    framebuffers: DashMap<ResourceId, FramebufferData>,
}

impl SideTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly created resource.
    pub fn insert(&self, id: ResourceId, kind: ResourceKind) {
        match kind {
            ResourceKind::Texture | ResourceKind::Renderbuffer => {
                self.textures.insert(id, TextureData::empty(kind));
            }
            ResourceKind::Framebuffer => {
                self.framebuffers.insert(id, FramebufferData::default());
            }
            ResourceKind::Device | ResourceKind::Buffer => {}
        }
    }

    pub fn remove(&self, id: ResourceId) {
        self.textures.remove(&id);
        self.framebuffers.remove(&id);
    }

    pub fn texture(&self, id: ResourceId) -> Option<TextureData> {
        self.textures.get(&id).map(|t| t.clone())
    }

    pub fn framebuffer(&self, id: ResourceId) -> Option<FramebufferData> {
        self.framebuffers.get(&id).map(|f| f.clone())
    }

    /// Apply a call's shape or attachment change. For attachment calls, returns
    /// what the slot held before.
    pub fn apply(&self, call: &Call) -> Option<ResourceId> {
        match call.attachment() {
            Some(a) if !a.framebuffer.is_null() => self.attach(a),
            Some(_) => None,
            None => {
                self.apply_storage(call);
                None
            }
        }
    }

    /// Update the shape of the resource a storage call targets.
    pub fn apply_storage(&self, call: &Call) {
        let (id, width, height, depth, samples, internal_format, dimension) = match *call {
            Call::TextureStorage {
                texture,
                width,
                height,
                depth,
                samples,
                internal_format,
                ..
            } => {
                let dimension = if depth > 1 {
                    3
                } else if height > 1 {
                    2
                } else {
                    1
                };
                (texture, width, height, depth.max(1), samples.max(1), internal_format, dimension)
            }
            Call::RenderbufferStorage {
                renderbuffer,
                internal_format,
                width,
                height,
            } => (renderbuffer, width, height, 1, 1, internal_format, 2),
            Call::RenderbufferStorageMultisample {
                internal_format,
                samples,
                width,
                height,
                renderbuffer,
            } => (renderbuffer, width, height, 1, samples.max(1), internal_format, 2),
            _ => return,
        };
        if let Some(mut tex) = self.textures.get_mut(&id) {
            tex.width = width;
            tex.height = height;
            tex.depth = depth;
            tex.samples = samples;
            tex.internal_format = internal_format;
            tex.dimension = dimension;
            trace!("{} storage {}x{}x{} fmt {:#x}", id, width, height, depth, internal_format);
        }
    }

    /// Put `a.resource` into the framebuffer slot and return what was there before.
    /// The attached resource picks up the matching target usage flag.
    pub fn attach(&self, a: Attachment) -> Option<ResourceId> {
        let previous = {
            let mut fb = self.framebuffers.entry(a.framebuffer).or_default();
            if a.resource.is_null() {
                fb.attachments.remove(&a.slot)
            } else {
                fb.attachments.insert(a.slot, a.resource)
            }
        };
        if let Some(mut tex) = self.textures.get_mut(&a.resource) {
            tex.usage |= if attachment::is_depth_or_stencil(a.slot) {
                TextureUsage::DEPTH_TARGET
            } else {
                TextureUsage::RENDER_TARGET
            };
        }
        previous
    }

    pub fn mark_sampled(&self, id: ResourceId) {
        if let Some(mut tex) = self.textures.get_mut(&id) {
            tex.usage |= TextureUsage::SAMPLED;
        }
    }

    /// Whether some slot of `framebuffer` still references `id`.
    pub fn is_attached(&self, framebuffer: ResourceId, id: ResourceId) -> bool {
        self.framebuffers
            .get(&framebuffer)
            .is_some_and(|fb| fb.references(id))
    }
}
