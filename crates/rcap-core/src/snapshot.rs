//! Capture file writer.
//!
//! Layout of the chunk payload:
//! 1. `DeviceInit`, then the device record's chunks;
//! 2. one block per resource in dependency order: `ResourceBlock`, the record's
//!    chunks, and `InitialContents` when the driver could read the contents back;
//! 3. for a frame capture, `FrameBegin`, the frame's chunks and `FrameEnd`.
//!
//! Clean records reuse the block bytes of the previous snapshot, so writing a
//! snapshot twice without changes in between yields identical output.

use std::collections::BTreeSet;

use rcap_protocol::stream::{encode_capture, StreamFlags};
use rcap_protocol::{ChunkType, ChunkWriter, ContextId, ResourceId, ResourceKind};
use tracing::{debug, info};

use crate::config::CaptureConfig;
use crate::context::FrameCapture;
use crate::driver::Driver;
use crate::error::Result;
use crate::identity::IdentityMap;
use crate::record::{RecordGraph, ResourceRecord};

/// One written capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// The capture file, header included
    pub bytes: Vec<u8>,
    /// Records serialized afresh, in stream order
    pub reserialized: Vec<ResourceId>,
    /// Records whose previous block was reused, in stream order
    pub reused: Vec<ResourceId>,
    /// Chunks of the captured frame, 0 for an idle snapshot
    pub frame_chunks: usize,
}

pub(crate) fn write_capture(
    graph: &mut RecordGraph,
    device: ResourceId,
    context: ContextId,
    ids: &IdentityMap,
    driver: &mut dyn Driver,
    frame: Option<&FrameCapture>,
    config: &CaptureConfig,
) -> Result<Snapshot> {
    let mut payload = Vec::new();

    let mut init = ChunkWriter::new(ChunkType::DeviceInit);
    init.put(&device).put(&context.0);
    init.finish().write_to(&mut payload);
    if let Some(record) = graph.get(device) {
        for chunk in record.chunks() {
            chunk.write_to(&mut payload);
        }
    }

    // A frame keeps the blocks prepared when it began: contents written during
    // the frame are replayed from the frame itself.
    let no_fresh = BTreeSet::new();
    let fresh = frame.map_or(&no_fresh, |f| f.created());
    let reserialized = refresh_blocks(graph, ids, driver, config, frame.is_none(), fresh);
    let mut reused = Vec::new();
    for id in graph.topological_order() {
        let Some(record) = graph.get(id) else {
            continue;
        };
        if let Some(block) = &record.cached_block {
            payload.extend_from_slice(block);
            if !reserialized.contains(&id) {
                reused.push(id);
            }
        }
    }

    let mut flags = StreamFlags::empty();
    let mut frame_chunks = 0;
    if let Some(frame) = frame {
        flags |= StreamFlags::HAS_FRAME;
        frame_chunks = frame.len();
        let mut begin = ChunkWriter::new(ChunkType::FrameBegin);
        begin.put(&frame.number()).put(&(frame.len() as u32));
        begin.finish().write_to(&mut payload);
        for chunk in frame.chunks() {
            chunk.write_to(&mut payload);
        }
        ChunkWriter::new(ChunkType::FrameEnd)
            .finish()
            .write_to(&mut payload);
    }

    debug!(
        "snapshot payload: {} bytes, {} block(s) written, {} reused",
        payload.len(),
        reserialized.len(),
        reused.len()
    );
    let bytes = encode_capture(&payload, flags, config.compression())?;
    info!(
        "context {}: wrote capture, {} bytes ({} payload)",
        context.0,
        bytes.len(),
        payload.len()
    );

    Ok(Snapshot {
        bytes,
        reserialized,
        reused,
        frame_chunks,
    })
}

/// Re-encode the block of every record that has none, and with `include_dirty`
/// of every dirty record too. Records in `fresh` are written without initial
/// contents. Returns the re-encoded ids in dependency order.
pub(crate) fn refresh_blocks(
    graph: &mut RecordGraph,
    ids: &IdentityMap,
    driver: &mut dyn Driver,
    config: &CaptureConfig,
    include_dirty: bool,
    fresh: &BTreeSet<ResourceId>,
) -> Vec<ResourceId> {
    let mut written = Vec::new();
    for id in graph.topological_order() {
        let Some(record) = graph.records.get_mut(&id) else {
            continue;
        };
        if record.kind() == ResourceKind::Device {
            continue;
        }
        let stale = record.cached_block.is_none() || (include_dirty && record.dirty);
        if !stale {
            continue;
        }
        cache_block(record, ids, driver, config, !fresh.contains(&id));
        if include_dirty {
            graph.clear_dirty(id);
        }
        written.push(id);
    }
    written
}

/// Encode the blocks of `adopted` now, leaving every other record alone.
pub(crate) fn prepare_blocks(
    graph: &mut RecordGraph,
    ids: &IdentityMap,
    driver: &mut dyn Driver,
    config: &CaptureConfig,
    adopted: &[ResourceId],
    fresh: &BTreeSet<ResourceId>,
) {
    for id in adopted {
        if let Some(record) = graph.records.get_mut(id) {
            cache_block(record, ids, driver, config, !fresh.contains(id));
            debug!("prepared block of adopted {}", id);
        }
    }
}

fn cache_block(
    record: &mut ResourceRecord,
    ids: &IdentityMap,
    driver: &mut dyn Driver,
    config: &CaptureConfig,
    with_contents: bool,
) {
    let contents = if with_contents
        && config.initial_contents
        && record.kind() != ResourceKind::Framebuffer
    {
        ids.resolve(record.id()).ok().and_then(|h| driver.fetch_contents(h))
    } else {
        None
    };
    record.cached_block = Some(encode_block(record, contents.as_deref()));
}

/// Frame one record as a block. The chunk count covers every chunk after the
/// block header, initial contents included.
fn encode_block(record: &ResourceRecord, contents: Option<&[u8]>) -> Vec<u8> {
    let count = record.chunks().len() + usize::from(contents.is_some());
    let mut out = Vec::new();

    let mut header = ChunkWriter::new(ChunkType::ResourceBlock);
    header
        .put(&record.id())
        .put(&record.kind())
        .put(&(count as u32));
    header.finish().write_to(&mut out);

    for chunk in record.chunks() {
        chunk.write_to(&mut out);
    }
    if let Some(data) = contents {
        let mut w = ChunkWriter::new(ChunkType::InitialContents);
        w.put(&record.id()).blob(data);
        w.finish().write_to(&mut out);
    }
    out
}
