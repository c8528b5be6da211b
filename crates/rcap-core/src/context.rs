//! Per-context capture front end.
//!
//! A [`CaptureContext`] owns everything that belongs to one native context: the
//! capture state, the record graph, the current bindings and the active frame.
//! Interception shims hand it calls in logical-id form; it performs the real call
//! through the [`Driver`] and then routes the serialized chunk according to the
//! capture state and the call's static scope.

use std::collections::BTreeSet;
use std::sync::Arc;

use rcap_protocol::calls::target;
use rcap_protocol::{Attachment, Call, Chunk, ContextId, LiveHandle, ResourceId, ResourceKind};
use tracing::{debug, info, trace, warn};

use crate::config::RcapConfig;
use crate::driver::{Driver, LiveArgs};
use crate::error::Result;
use crate::identity::IdentityMap;
use crate::record::RecordGraph;
use crate::replay::ReplaySession;
use crate::side_table::SideTables;
use crate::snapshot::{self, Snapshot};
use crate::state::{CaptureState, Route, StateMachine};

/// Structures every context of a share group sees: the identity map and the
/// side tables.
#[derive(Default)]
pub struct SharedResources {
    ids: IdentityMap,
    tables: SideTables,
}

impl SharedResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> &IdentityMap {
        &self.ids
    }

    pub fn tables(&self) -> &SideTables {
        &self.tables
    }
}

/// Framebuffers currently bound on a context. Null is the default framebuffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bindings {
    draw_framebuffer: ResourceId,
    read_framebuffer: ResourceId,
}

impl Bindings {
    /// The framebuffer a target-based call on `target` refers to.
    pub fn bound_framebuffer(&self, target: u32) -> ResourceId {
        if target == target::READ_FRAMEBUFFER {
            self.read_framebuffer
        } else {
            self.draw_framebuffer
        }
    }

    pub fn draw_framebuffer(&self) -> ResourceId {
        self.draw_framebuffer
    }

    pub fn read_framebuffer(&self) -> ResourceId {
        self.read_framebuffer
    }

    fn bind(&mut self, bind_target: u32, framebuffer: ResourceId) {
        if target::is_draw(bind_target) {
            self.draw_framebuffer = framebuffer;
        }
        if bind_target == target::READ_FRAMEBUFFER || bind_target == target::FRAMEBUFFER {
            self.read_framebuffer = framebuffer;
        }
    }

    fn forget(&mut self, id: ResourceId) {
        if self.draw_framebuffer == id {
            self.draw_framebuffer = ResourceId::null();
        }
        if self.read_framebuffer == id {
            self.read_framebuffer = ResourceId::null();
        }
    }
}

/// Chunks collected while a frame is being captured, in call order.
#[derive(Debug)]
pub struct FrameCapture {
    number: u64,
    chunks: Vec<Chunk>,
    /// Resources created inside the frame. Their contents come from the frame.
    created: BTreeSet<ResourceId>,
    /// Records of resources deleted inside the frame, retired once it is written.
    retired: Vec<ResourceId>,
}

impl FrameCapture {
    fn new(number: u64) -> Self {
        Self {
            number,
            chunks: Vec::new(),
            created: BTreeSet::new(),
            retired: Vec::new(),
        }
    }

    pub(crate) fn created(&self) -> &BTreeSet<ResourceId> {
        &self.created
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

pub struct CaptureContext {
    pub(crate) context: ContextId,
    pub(crate) device: ResourceId,
    pub(crate) shared: Arc<SharedResources>,
    pub(crate) config: RcapConfig,
    pub(crate) state: StateMachine,
    pub(crate) graph: RecordGraph,
    bindings: Bindings,
    frame: Option<FrameCapture>,
    frames_captured: u64,
    pub(crate) replay: Option<ReplaySession>,
}

impl CaptureContext {
    pub fn new(context: ContextId, shared: Arc<SharedResources>, config: RcapConfig) -> Result<Self> {
        let device = shared
            .ids()
            .register(LiveHandle::new(context, ResourceKind::Device, 0));
        let mut graph = RecordGraph::new();
        graph.add_record(device, ResourceKind::Device);

        let mut ctx = Self {
            context,
            device,
            shared,
            config,
            state: StateMachine::new(),
            graph,
            bindings: Bindings::default(),
            frame: None,
            frames_captured: 0,
            replay: None,
        };
        if ctx.config.capture.track_on_start {
            ctx.state.enable_tracking()?;
        }
        info!("context {}: capture context ready, device {}", context.0, device);
        Ok(ctx)
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    /// Logical id of the device record holding device-scoped state.
    pub fn device(&self) -> ResourceId {
        self.device
    }

    pub fn state(&self) -> CaptureState {
        self.state.state()
    }

    pub fn graph(&self) -> &RecordGraph {
        &self.graph
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn shared(&self) -> &Arc<SharedResources> {
        &self.shared
    }

    pub fn config(&self) -> &RcapConfig {
        &self.config
    }

    /// The frame being captured, if any.
    pub fn frame(&self) -> Option<&FrameCapture> {
        self.frame.as_ref()
    }

    pub fn enable_tracking(&mut self) -> Result<()> {
        self.state.enable_tracking()
    }

    pub fn disable_tracking(&mut self) -> Result<()> {
        self.state.disable_tracking()
    }

    /// Start capturing a frame. Dirty records are serialized right away so the
    /// capture holds resource contents as they were when the frame began.
    pub fn begin_frame(&mut self, driver: &mut dyn Driver) -> Result<()> {
        self.state.begin_frame()?;
        snapshot::refresh_blocks(
            &mut self.graph,
            self.shared.ids(),
            driver,
            &self.config.capture,
            true,
            &BTreeSet::new(),
        );
        self.frames_captured += 1;
        self.frame = Some(FrameCapture::new(self.frames_captured));
        info!("context {}: capturing frame {}", self.context.0, self.frames_captured);
        Ok(())
    }

    /// Stop the frame capture and write it out together with the resource
    /// records it needs. Resources deleted during the frame lose their records
    /// only after that.
    pub fn end_frame(&mut self, driver: &mut dyn Driver) -> Result<Snapshot> {
        self.state.end_frame()?;
        let frame = self.frame.take();
        let written = snapshot::write_capture(
            &mut self.graph,
            self.device,
            self.context,
            self.shared.ids(),
            driver,
            frame.as_ref(),
            &self.config.capture,
        );
        for id in frame.iter().flat_map(|f| f.retired.iter()) {
            if self.graph.contains(*id) {
                self.graph.retire(*id)?;
            }
        }
        let snapshot = written?;
        info!(
            "context {}: captured frame {}, {} bytes",
            self.context.0,
            frame.as_ref().map_or(0, |f| f.number()),
            snapshot.bytes.len()
        );
        Ok(snapshot)
    }

    /// Serialize the current resource state without a frame.
    pub fn snapshot(&mut self, driver: &mut dyn Driver) -> Result<Snapshot> {
        self.state.expect(CaptureState::IdleRecord)?;
        snapshot::write_capture(
            &mut self.graph,
            self.device,
            self.context,
            self.shared.ids(),
            driver,
            None,
            &self.config.capture,
        )
    }

    /// Create a native resource and start tracking it.
    pub fn create_resource(&mut self, kind: ResourceKind, driver: &mut dyn Driver) -> Result<ResourceId> {
        let name = driver.create(kind)?;
        self.register_created(kind, name)
    }

    /// Start tracking a resource the application already created natively.
    /// Registering the same name again returns the id it already has.
    pub fn register_created(&mut self, kind: ResourceKind, name: u64) -> Result<ResourceId> {
        let handle = LiveHandle::new(self.context, kind, name);
        if let Some(id) = self.shared.ids().lookup_id(&handle) {
            return Ok(id);
        }
        let id = self.shared.ids().register(handle);
        self.shared.tables().insert(id, kind);
        if let Some(call) = Call::creation(kind, id) {
            self.record(&call, None)?;
        }
        Ok(id)
    }

    /// Perform an intercepted call and record it as the capture state dictates.
    pub fn dispatch(&mut self, call: Call, driver: &mut dyn Driver) -> Result<()> {
        let args = LiveArgs::resolve(self.shared.ids(), &call)?;

        if let Call::DeleteResource { id } = call {
            return self.delete_resource(id, driver);
        }
        if let Some((id, kind)) = call.created() {
            // The native object exists already, only its record is missing.
            if self.shared.tables().texture(id).is_none() && self.shared.tables().framebuffer(id).is_none() {
                self.shared.tables().insert(id, kind);
            }
            return self.record(&call, None);
        }

        self.adopt_referenced(&call, driver)?;
        driver.execute(&call, &args)?;
        let previous = self.apply_side_effects(&call);
        self.record(&call, previous)
    }

    /// Give every resource a recorded call refers to a record before the call
    /// runs. Inside a frame the new blocks are written right away, with contents
    /// as they are before the call.
    fn adopt_referenced(&mut self, call: &Call, driver: &mut dyn Driver) -> Result<()> {
        let route = self.state.route(call.scope());
        if !route.record && !route.frame {
            return Ok(());
        }
        let mut adopted = Vec::new();
        for id in call.resource_ids() {
            self.adopt(id, &mut adopted)?;
        }
        if adopted.is_empty() {
            return Ok(());
        }
        if let Some(frame) = &self.frame {
            snapshot::prepare_blocks(
                &mut self.graph,
                self.shared.ids(),
                driver,
                &self.config.capture,
                &adopted,
                frame.created(),
            );
        }
        Ok(())
    }

    fn apply_side_effects(&mut self, call: &Call) -> Option<ResourceId> {
        match *call {
            Call::BindFramebuffer { target, framebuffer } => {
                self.bindings.bind(target, framebuffer);
            }
            Call::BlitFramebuffer { .. } => {
                let read = self.bindings.read_framebuffer();
                if let Some(fb) = self.shared.tables().framebuffer(read) {
                    for id in fb.attachments.values() {
                        self.shared.tables().mark_sampled(*id);
                    }
                }
            }
            _ => {}
        }
        self.shared.tables().apply(call)
    }

    fn record(&mut self, call: &Call, previous: Option<ResourceId>) -> Result<()> {
        let route = self.state.route(call.scope());
        trace!("{} -> {:?} in {:?}", call.chunk_type(), route, self.state.state());
        if route == Route::default() {
            return Ok(());
        }

        if route.track {
            self.track(call);
        }
        if route.record {
            if let Some(a) = call.attachment() {
                relink(&mut self.graph, self.shared.tables(), a, previous)?;
            }
        }
        if route.frame {
            if let Some(frame) = self.frame.as_mut() {
                frame.chunks.push(call.encode());
            }
        }
        if route.record {
            self.append_to_record(call)?;
        }
        debug!("routed {} ({:?})", call.chunk_type(), route);
        Ok(())
    }

    fn track(&mut self, call: &Call) {
        match *call {
            Call::TextureSubImage { texture, .. } | Call::InvalidateTexImage { texture, .. } => {
                self.graph.mark_dirty(texture);
            }
            Call::InvalidateFramebuffer { framebuffer, .. } if !framebuffer.is_null() => {
                self.graph.mark_parents_dirty(framebuffer);
            }
            _ => {}
        }
    }

    fn append_to_record(&mut self, call: &Call) -> Result<()> {
        if let Some((id, kind)) = call.created() {
            if let Some(frame) = self.frame.as_mut() {
                frame.created.insert(id);
            }
            self.graph.add_record(id, kind);
            return self.graph.add_chunk(id, call.encode());
        }

        let target = call.target();
        if target.is_null()
            && matches!(call, Call::FramebufferDrawBuffers { .. })
            && self.state.state() == CaptureState::IdleRecord
        {
            trace!("dropping draw buffers on the default framebuffer");
            return Ok(());
        }

        let owner = if self.graph.contains(target) {
            target
        } else {
            if !target.is_null() {
                warn!(
                    "no record for {}, recording {} into the device record",
                    target,
                    call.chunk_type()
                );
            }
            self.device
        };

        let coalesce = self
            .graph
            .get(owner)
            .is_some_and(|r| r.kind() == ResourceKind::Framebuffer);
        if coalesce {
            self.graph.coalesce_chunk(owner, call.encode())?;
        } else {
            self.graph.add_chunk(owner, call.encode())?;
        }
        Ok(())
    }

    /// Give a resource that was created while nothing was recorded a record of
    /// its own, starting with its creation chunk. A framebuffer gets its current
    /// attachments rebuilt from the side tables, attached resources adopted
    /// first. Every newly adopted id is pushed to `adopted`.
    fn adopt(&mut self, id: ResourceId, adopted: &mut Vec<ResourceId>) -> Result<()> {
        if self.graph.contains(id) {
            return Ok(());
        }
        let handle = self.shared.ids().resolve(id)?;
        let Some(creation) = Call::creation(handle.kind, id) else {
            return Ok(());
        };
        debug!("adopting {} created before tracking", id);
        self.graph.add_record(id, handle.kind);
        self.graph.add_chunk(id, creation.encode())?;
        adopted.push(id);

        let Some(fb) = self.shared.tables().framebuffer(id) else {
            return Ok(());
        };
        for (slot, resource) in fb.attachments {
            let Ok(attached) = self.shared.ids().resolve(resource) else {
                continue;
            };
            let Some(call) = attachment_call(id, slot, resource, attached.kind) else {
                continue;
            };
            self.adopt(resource, adopted)?;
            self.graph.add_chunk(id, call.encode())?;
            self.graph.add_parent(id, resource)?;
        }
        Ok(())
    }

    /// Destroy a resource. Its record stays around as long as a dependent still
    /// needs it, and during a frame until the frame is written.
    fn delete_resource(&mut self, id: ResourceId, driver: &mut dyn Driver) -> Result<()> {
        let handle = self.shared.ids().resolve(id)?;
        driver.destroy(handle)?;
        self.shared.ids().unregister(id);
        self.shared.tables().remove(id);
        self.bindings.forget(id);
        if self.graph.contains(id) {
            match self.frame.as_mut() {
                Some(frame) => frame.retired.push(id),
                None => self.graph.retire(id)?,
            }
        }
        debug!("deleted {}", id);
        Ok(())
    }
}

/// The call that puts `resource` into `slot` of `framebuffer`, or `None` when a
/// resource of `kind` cannot be attached.
fn attachment_call(
    framebuffer: ResourceId,
    slot: u32,
    resource: ResourceId,
    kind: ResourceKind,
) -> Option<Call> {
    if !kind.is_attachable() {
        return None;
    }
    Some(if kind == ResourceKind::Renderbuffer {
        Call::FramebufferRenderbuffer {
            framebuffer,
            attachment: slot,
            renderbuffer_target: target::RENDERBUFFER,
            renderbuffer: resource,
        }
    } else {
        Call::FramebufferTexture {
            attachment: slot,
            texture: resource,
            level: 0,
            framebuffer,
        }
    })
}

/// Keep the framebuffer's parent edges in line with an attachment change.
/// The old occupant's edge goes only when no other slot still holds it.
pub(crate) fn relink(
    graph: &mut RecordGraph,
    tables: &SideTables,
    a: Attachment,
    previous: Option<ResourceId>,
) -> Result<()> {
    if a.framebuffer.is_null() || !graph.contains(a.framebuffer) {
        return Ok(());
    }
    let stale = previous.filter(|p| *p != a.resource && !tables.is_attached(a.framebuffer, *p));
    if a.resource.is_null() {
        if let Some(p) = stale {
            graph.remove_parent(a.framebuffer, p)?;
        }
        return Ok(());
    }
    graph.rebind(a.framebuffer, stale, a.resource)
}
