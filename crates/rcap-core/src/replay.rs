//! Replay of capture files.
//!
//! Replay is two-phase. Decoding reads the whole chunk stream first; phase one
//! then creates a fresh native object for every creation chunk and binds it to
//! the logical id read from the stream, and phase two reissues every other call
//! once all of its ids resolve. A failure anywhere destroys every native object
//! the replay created before the error is returned.

use std::collections::BTreeSet;

use rcap_protocol::opcode::opcode_name;
use rcap_protocol::stream::{decode_capture, ChunkStream, RawChunk};
use rcap_protocol::{
    Call, CallScope, ChunkReader, ChunkType, CodecError, LiveHandle, ResourceId, ResourceKind,
    StreamError,
};
use tracing::{debug, error, info, warn};

use crate::config::ReplayConfig;
use crate::context::{relink, CaptureContext};
use crate::driver::{Driver, LiveArgs};
use crate::error::{CaptureError, Result};
use crate::record::RecordGraph;
use crate::state::CaptureState;

/// What a replay did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Device id recorded in the stream
    pub device: ResourceId,
    pub frame_number: Option<u64>,
    /// Native objects created
    pub resources: usize,
    /// Calls reissued while decoding, frame calls included
    pub calls: usize,
    /// Calls in the captured frame
    pub frame_calls: usize,
    pub contents_applied: usize,
    /// Chunks with unrecognized opcodes that were skipped
    pub skipped_chunks: usize,
}

/// State kept between decoding a capture and ending its replay.
pub(crate) struct ReplaySession {
    created: Vec<(ResourceId, LiveHandle)>,
    graph: RecordGraph,
    frame: Vec<Call>,
    report: ReplayReport,
}

impl ReplaySession {
    fn new() -> Self {
        Self {
            created: Vec::new(),
            graph: RecordGraph::new(),
            frame: Vec::new(),
            report: ReplayReport::default(),
        }
    }
}

enum Step {
    Call { call: Call, opcode: u32, offset: u64 },
    Contents { id: ResourceId, data: Vec<u8> },
}

#[derive(Default)]
struct Decoded {
    device: ResourceId,
    frame_number: Option<u64>,
    creations: Vec<(ResourceId, ResourceKind)>,
    steps: Vec<Step>,
    frame: Vec<(Call, u32, u64)>,
    skipped: usize,
}

fn malformed(raw: &RawChunk<'_>, reason: impl ToString) -> CaptureError {
    CaptureError::MalformedChunk {
        opcode: raw.opcode,
        offset: raw.offset,
        reason: reason.to_string(),
    }
}

fn framing_error(err: StreamError) -> CaptureError {
    let reason = err.to_string();
    match err {
        StreamError::ChunkTooLarge { opcode, offset, .. } => CaptureError::MalformedChunk {
            opcode,
            offset,
            reason,
        },
        StreamError::Truncated { offset } => CaptureError::MalformedChunk {
            opcode: 0,
            offset,
            reason,
        },
        other => CaptureError::Stream(other),
    }
}

/// Read a structure chunk's fields, requiring the payload to be fully consumed.
fn read_fields<T>(
    raw: &RawChunk<'_>,
    f: impl FnOnce(&mut ChunkReader<'_>) -> Result<T, CodecError>,
) -> Result<T> {
    let mut r = ChunkReader::new(raw.payload);
    let value = f(&mut r).map_err(|e| malformed(raw, e))?;
    r.finish().map_err(|e| malformed(raw, e))?;
    Ok(value)
}

/// A structure chunk that declares how many chunks follow it.
struct Section {
    opcode: u32,
    offset: u64,
    declared: u32,
    seen: u32,
    /// Resource a block belongs to; `None` for the frame
    owner: Option<(ResourceId, ResourceKind)>,
}

impl Section {
    fn open(raw: &RawChunk<'_>, declared: u32, owner: Option<(ResourceId, ResourceKind)>) -> Self {
        Self {
            opcode: raw.opcode,
            offset: raw.offset,
            declared,
            seen: 0,
            owner,
        }
    }

    fn is_full(&self) -> bool {
        self.seen >= self.declared
    }

    fn error(&self, reason: impl ToString) -> CaptureError {
        CaptureError::MalformedChunk {
            opcode: self.opcode,
            offset: self.offset,
            reason: reason.to_string(),
        }
    }

    fn count_mismatch(&self) -> CaptureError {
        self.error(format!(
            "declares {} chunk(s), {} follow",
            self.declared, self.seen
        ))
    }
}

/// Where a call or contents chunk sits in the stream.
#[derive(Clone, Copy)]
enum Place {
    /// Device state ahead of the first block
    Device,
    Block {
        owner: ResourceId,
        kind: ResourceKind,
        first: bool,
    },
    Frame,
}

fn is_header(ty: ChunkType) -> bool {
    matches!(
        ty,
        ChunkType::DeviceInit | ChunkType::ResourceBlock | ChunkType::FrameBegin | ChunkType::FrameEnd
    )
}

fn decode_payload(payload: &[u8], config: &ReplayConfig) -> Result<Decoded> {
    let mut decoded = Decoded::default();
    let mut seen = BTreeSet::new();
    let mut block: Option<Section> = None;
    let mut last_block: Option<Section> = None;
    let mut frame: Option<Section> = None;
    let mut frame_done = false;

    for raw in ChunkStream::with_limit(payload, config.max_chunk_size) {
        let raw = raw.map_err(framing_error)?;
        let ty = raw.chunk_type();

        if let Some(open) = frame.as_mut() {
            if ty == Some(ChunkType::FrameEnd) {
                read_fields(&raw, |_| Ok(()))?;
                if open.seen != open.declared {
                    return Err(open.count_mismatch());
                }
                frame = None;
                frame_done = true;
                continue;
            }
            if ty.is_some_and(is_header) {
                return Err(malformed(&raw, "structure chunk inside a frame"));
            }
            open.seen += 1;
            if open.seen > open.declared {
                return Err(open.count_mismatch());
            }
            decode_member(&mut decoded, &mut seen, &raw, config, Place::Frame)?;
            continue;
        }

        if let Some(open) = block.as_mut() {
            if ty.is_some_and(is_header) {
                return Err(open.count_mismatch());
            }
            open.seen += 1;
            let place = match open.owner {
                Some((owner, kind)) => Place::Block {
                    owner,
                    kind,
                    first: open.seen == 1,
                },
                None => Place::Device,
            };
            decode_member(&mut decoded, &mut seen, &raw, config, place)?;
            if open.is_full() {
                last_block = block.take();
            }
            continue;
        }

        match ty {
            Some(ChunkType::DeviceInit) => {
                let (device, _context) =
                    read_fields(&raw, |r| Ok((r.get::<ResourceId>()?, r.get::<u32>()?)))?;
                decoded.device = device;
            }
            Some(ChunkType::ResourceBlock) => {
                if frame_done {
                    return Err(malformed(&raw, "resource block after the frame"));
                }
                let (id, kind, count) = read_fields(&raw, |r| {
                    Ok((r.get::<ResourceId>()?, r.get::<ResourceKind>()?, r.get::<u32>()?))
                })?;
                debug!("block {} ({:?}, {} chunk(s))", id, kind, count);
                if count == 0 {
                    return Err(malformed(&raw, format!("block of {} has no creation chunk", id)));
                }
                block = Some(Section::open(&raw, count, Some((id, kind))));
            }
            Some(ChunkType::FrameBegin) => {
                if frame_done {
                    return Err(malformed(&raw, "second frame in one capture"));
                }
                let (number, count) =
                    read_fields(&raw, |r| Ok((r.get::<u64>()?, r.get::<u32>()?)))?;
                decoded.frame_number = Some(number);
                frame = Some(Section::open(&raw, count, None));
            }
            Some(ChunkType::FrameEnd) => {
                return Err(malformed(&raw, "frame end without a frame"));
            }
            _ => {
                // Loose chunks only carry device state ahead of the first block.
                if let Some(last) = last_block.as_mut() {
                    last.seen += 1;
                    return Err(last.count_mismatch());
                }
                if frame_done {
                    return Err(malformed(&raw, "chunk after the frame"));
                }
                decode_member(&mut decoded, &mut seen, &raw, config, Place::Device)?;
            }
        }
    }

    if let Some(open) = block {
        return Err(open.count_mismatch());
    }
    if let Some(open) = frame {
        return Err(open.error("frame has no end"));
    }
    Ok(decoded)
}

/// Decode one chunk that is not a structure header.
fn decode_member(
    decoded: &mut Decoded,
    seen: &mut BTreeSet<ResourceId>,
    raw: &RawChunk<'_>,
    config: &ReplayConfig,
    place: Place,
) -> Result<()> {
    let Some(ty) = raw.chunk_type() else {
        if !config.skip_unknown_chunks {
            return Err(malformed(raw, "unknown opcode"));
        }
        if let Place::Block { first: true, owner, .. } = place {
            return Err(malformed(raw, format!("block of {} does not start with its creation", owner)));
        }
        warn!(
            "skipping {} at offset {} ({} bytes)",
            opcode_name(raw.opcode),
            raw.offset,
            raw.payload.len()
        );
        decoded.skipped += 1;
        return Ok(());
    };

    if ty == ChunkType::InitialContents {
        let (id, data) = read_fields(raw, |r| Ok((r.get::<ResourceId>()?, r.blob()?)))?;
        match place {
            Place::Block { owner, first: false, .. } if owner == id => {
                decoded.steps.push(Step::Contents { id, data });
                return Ok(());
            }
            _ => return Err(malformed(raw, format!("contents of {} outside its block", id))),
        }
    }

    let call = Call::decode(ty, raw.payload).map_err(|e| malformed(raw, e))?;
    if let Place::Block { owner, kind, first: true } = place {
        if call.created() != Some((owner, kind)) {
            return Err(malformed(
                raw,
                format!("block of {} ({:?}) does not start with its creation", owner, kind),
            ));
        }
    }

    if let Some((id, kind)) = call.created() {
        if seen.insert(id) {
            decoded.creations.push((id, kind));
        }
    } else if call.scope() == CallScope::Deletion {
        warn!("ignoring {} at offset {}", ty, raw.offset);
    } else if matches!(place, Place::Frame) {
        decoded.frame.push((call, raw.opcode, raw.offset));
    } else {
        decoded.steps.push(Step::Call {
            call,
            opcode: raw.opcode,
            offset: raw.offset,
        });
    }
    Ok(())
}

impl CaptureContext {
    /// Replay a capture file: decode it, recreate its resources against `driver`
    /// and reissue its calls. Leaves the context in ReplayExecute, ready to
    /// re-run the captured frame.
    pub fn replay(&mut self, bytes: &[u8], driver: &mut dyn Driver) -> Result<ReplayReport> {
        self.state.begin_replay()?;
        if let Some(mut previous) = self.replay.take() {
            self.release(&mut previous, driver);
        }
        let mut session = ReplaySession::new();
        match self.decode_and_apply(bytes, driver, &mut session) {
            Ok(()) => {
                self.state.finish_decode()?;
                let report = session.report.clone();
                info!(
                    "context {}: replayed capture, {} resource(s), {} call(s), {} skipped",
                    self.context.0,
                    report.resources,
                    report.calls,
                    report.skipped_chunks
                );
                self.replay = Some(session);
                Ok(report)
            }
            Err(e) => {
                error!("context {}: replay aborted: {}", self.context.0, e);
                self.release(&mut session, driver);
                self.state.abort_replay()?;
                Err(e)
            }
        }
    }

    fn decode_and_apply(
        &self,
        bytes: &[u8],
        driver: &mut dyn Driver,
        session: &mut ReplaySession,
    ) -> Result<()> {
        let (_, payload) = decode_capture(bytes)?;
        let decoded = decode_payload(&payload, &self.config.replay)?;
        session.report.device = decoded.device;
        session.report.frame_number = decoded.frame_number;
        session.report.skipped_chunks = decoded.skipped;

        // Phase 1: every resource exists and has its id before anything refers to it.
        for (id, kind) in decoded.creations {
            let name = driver.create(kind)?;
            let handle = LiveHandle::new(driver.context(), kind, name);
            session.created.push((id, handle));
            self.shared.ids().bind_live(id, handle)?;
            self.shared.tables().insert(id, kind);
            session.graph.add_record(id, kind);
            session.report.resources += 1;
        }

        // Phase 2: resource state, then the frame in call order.
        for step in decoded.steps {
            match step {
                Step::Call {
                    call,
                    opcode,
                    offset,
                } => {
                    self.reissue(&call, driver, &mut session.graph)
                        .map_err(|e| at_chunk(e, opcode, offset))?;
                    session.report.calls += 1;
                }
                Step::Contents { id, data } => {
                    let handle = self.shared.ids().resolve(id)?;
                    driver.apply_contents(handle, &data)?;
                    session.report.contents_applied += 1;
                }
            }
        }
        for (call, opcode, offset) in decoded.frame {
            self.reissue(&call, driver, &mut session.graph)
                .map_err(|e| at_chunk(e, opcode, offset))?;
            session.report.calls += 1;
            session.frame.push(call);
        }
        session.report.frame_calls = session.frame.len();
        Ok(())
    }

    /// Resolve a decoded call's ids and issue it.
    fn reissue(&self, call: &Call, driver: &mut dyn Driver, graph: &mut RecordGraph) -> Result<()> {
        let args = LiveArgs::resolve(self.shared.ids(), call)?;
        driver.execute(call, &args)?;
        let previous = self.shared.tables().apply(call);
        if let Some(a) = call.attachment() {
            relink(graph, self.shared.tables(), a, previous)?;
        }
        Ok(())
    }

    /// Re-run the decoded frame verbatim.
    pub fn replay_frame(&mut self, driver: &mut dyn Driver) -> Result<usize> {
        self.state.expect(CaptureState::ReplayExecute)?;
        let Some(mut session) = self.replay.take() else {
            return Ok(0);
        };
        let frame = std::mem::take(&mut session.frame);
        let result = frame
            .iter()
            .try_for_each(|call| self.reissue(call, driver, &mut session.graph));
        session.frame = frame;
        let count = session.frame.len();
        self.replay = Some(session);
        result.map(|()| count)
    }

    /// Leave replay. The replayed resources stay alive until
    /// [`release_replay`](Self::release_replay).
    pub fn end_replay(&mut self) -> Result<()> {
        self.state.end_replay()
    }

    /// Destroy every resource the last replay created.
    pub fn release_replay(&mut self, driver: &mut dyn Driver) -> Result<()> {
        self.state.expect(CaptureState::IdleExecute)?;
        if let Some(mut session) = self.replay.take() {
            self.release(&mut session, driver);
        }
        Ok(())
    }

    /// Graph rebuilt from the attachment calls of the last replay.
    pub fn replayed_graph(&self) -> Option<&RecordGraph> {
        self.replay.as_ref().map(|s| &s.graph)
    }

    fn release(&self, session: &mut ReplaySession, driver: &mut dyn Driver) {
        let count = session.created.len();
        for (id, handle) in session.created.drain(..).rev() {
            if self.shared.ids().lookup_id(&handle) == Some(id) {
                self.shared.ids().unregister(id);
            }
            self.shared.tables().remove(id);
            if let Err(e) = driver.destroy(handle) {
                warn!("failed to destroy replayed {}: {}", handle, e);
            }
        }
        session.graph = RecordGraph::new();
        if count > 0 {
            info!("context {}: released {} replayed resource(s)", self.context.0, count);
        }
    }
}

/// Attach the position of the chunk being reissued to a codec failure. Other
/// errors keep their kind.
fn at_chunk(err: CaptureError, opcode: u32, offset: u64) -> CaptureError {
    match err {
        CaptureError::Codec(e) => CaptureError::MalformedChunk {
            opcode,
            offset,
            reason: e.to_string(),
        },
        other => {
            debug!("{:#06x} at offset {} failed: {}", opcode, offset, other);
            other
        }
    }
}
