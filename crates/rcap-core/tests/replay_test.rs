//! Integration test: capture -> replay round trips
//!
//! Captures with one NullDriver and replays into a second one whose native names
//! start elsewhere, so only logical ids can tie the two runs together.
//!
//! Run with: cargo test -p rcap-core --test replay_test

use std::sync::Arc;

use rcap_core::{
    CaptureContext, CaptureError, CaptureState, NullDriver, RcapConfig, SharedResources,
};
use rcap_protocol::calls::{attachment, target};
use rcap_protocol::stream::{decode_capture, encode_capture, ChunkStream, StreamFlags};
use rcap_protocol::{
    Call, Chunk, ChunkReader, ChunkType, ChunkWriter, ContextId, ResourceId, ResourceKind,
};

fn fresh_context(config: RcapConfig) -> CaptureContext {
    CaptureContext::new(ContextId(0), Arc::new(SharedResources::new()), config).unwrap()
}

fn storage(texture: ResourceId) -> Call {
    Call::TextureStorage {
        texture,
        target: 0x0DE1,
        levels: 1,
        internal_format: 0x8058,
        width: 32,
        height: 32,
        depth: 1,
        samples: 1,
    }
}

fn attach(framebuffer: ResourceId, texture: ResourceId) -> Call {
    Call::FramebufferTexture2D {
        attachment: attachment::COLOR0,
        texture,
        textarget: 0x0DE1,
        level: 0,
        framebuffer,
    }
}

fn sub_image(texture: ResourceId, fill: u8) -> Call {
    Call::TextureSubImage {
        texture,
        level: 0,
        offset: [0, 0, 0],
        extent: [1, 1, 1],
        format: 0x1908,
        data: vec![fill; 4],
    }
}

fn bind(framebuffer: ResourceId) -> Call {
    Call::BindFramebuffer {
        target: target::FRAMEBUFFER,
        framebuffer,
    }
}

fn draw() -> Call {
    Call::Draw {
        mode: 4,
        first: 0,
        count: 6,
    }
}

struct Captured {
    bytes: Vec<u8>,
    edges: Vec<(ResourceId, ResourceId)>,
    ids: [ResourceId; 4],
}

/// Two texture/framebuffer pairs, contents written into the first texture, and
/// one frame that binds the first framebuffer and draws.
fn capture_scene() -> Captured {
    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::new(ContextId(0));
    ctx.enable_tracking().unwrap();

    let a = ctx.create_resource(ResourceKind::Texture, &mut driver).unwrap();
    let b = ctx.create_resource(ResourceKind::Framebuffer, &mut driver).unwrap();
    let c = ctx.create_resource(ResourceKind::Texture, &mut driver).unwrap();
    let d = ctx.create_resource(ResourceKind::Framebuffer, &mut driver).unwrap();
    ctx.dispatch(storage(a), &mut driver).unwrap();
    ctx.dispatch(storage(c), &mut driver).unwrap();
    ctx.dispatch(attach(b, a), &mut driver).unwrap();
    ctx.dispatch(attach(d, c), &mut driver).unwrap();
    ctx.dispatch(
        Call::TextureSubImage {
            texture: a,
            level: 0,
            offset: [0, 0, 0],
            extent: [1, 1, 1],
            format: 0x1908,
            data: vec![1, 2, 3, 4],
        },
        &mut driver,
    )
    .unwrap();

    ctx.begin_frame(&mut driver).unwrap();
    ctx.dispatch(
        Call::BindFramebuffer {
            target: target::FRAMEBUFFER,
            framebuffer: b,
        },
        &mut driver,
    )
    .unwrap();
    ctx.dispatch(
        Call::Draw {
            mode: 4,
            first: 0,
            count: 6,
        },
        &mut driver,
    )
    .unwrap();
    let snapshot = ctx.end_frame(&mut driver).unwrap();

    Captured {
        bytes: snapshot.bytes,
        edges: ctx.graph().edges().into_iter().collect(),
        ids: [a, b, c, d],
    }
}

fn block_header(id: ResourceId, kind: ResourceKind, count: u32) -> Chunk {
    let mut w = ChunkWriter::new(ChunkType::ResourceBlock);
    w.put(&id).put(&kind).put(&count);
    w.finish()
}

fn frame_begin(number: u64, count: u32) -> Chunk {
    let mut w = ChunkWriter::new(ChunkType::FrameBegin);
    w.put(&number).put(&count);
    w.finish()
}

/// Every InitialContents chunk of a capture file, in stream order.
fn initial_contents(bytes: &[u8]) -> Vec<(ResourceId, Vec<u8>)> {
    let (_, payload) = decode_capture(bytes).unwrap();
    ChunkStream::new(&payload)
        .map(|raw| raw.unwrap())
        .filter(|raw| raw.chunk_type() == Some(ChunkType::InitialContents))
        .map(|raw| {
            let mut r = ChunkReader::new(raw.payload);
            (r.get::<ResourceId>().unwrap(), r.blob().unwrap())
        })
        .collect()
}

fn capture_of(chunks: &[Chunk]) -> Vec<u8> {
    let mut payload = Vec::new();
    let mut init = ChunkWriter::new(ChunkType::DeviceInit);
    init.put(&ResourceId(1)).put(&0u32);
    init.finish().write_to(&mut payload);
    for chunk in chunks {
        chunk.write_to(&mut payload);
    }
    encode_capture(&payload, StreamFlags::empty(), None).unwrap()
}

#[test]
fn test_round_trip_preserves_graph() {
    let captured = capture_scene();
    let [a, b, c, d] = captured.ids;

    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::with_first_name(ContextId(0), 1000);
    let report = ctx.replay(&captured.bytes, &mut driver).unwrap();

    assert_eq!(ctx.state(), CaptureState::ReplayExecute);
    assert_eq!(report.device, ResourceId(1));
    assert_eq!(report.resources, 4);
    assert_eq!(report.frame_number, Some(1));
    assert_eq!(report.frame_calls, 2);
    assert_eq!(report.calls, 6);
    assert_eq!(report.contents_applied, 1);
    assert_eq!(report.skipped_chunks, 0);

    let replayed: Vec<_> = ctx.replayed_graph().unwrap().edges().into_iter().collect();
    assert_eq!(replayed, captured.edges);
    assert_eq!(replayed, vec![(b, a), (d, c)]);

    // Same logical ids, unrelated native names.
    for id in [a, b, c, d] {
        let live = ctx.shared().ids().resolve(id).unwrap();
        assert!(live.name >= 1000);
        assert!(driver.is_live(&live));
    }
    let tex = ctx.shared().tables().texture(a).unwrap();
    assert_eq!((tex.width, tex.height), (32, 32));
    assert_eq!(
        ctx.shared().tables().framebuffer(b).unwrap().attachments[&attachment::COLOR0],
        a
    );

    let handle_a = ctx.shared().ids().resolve(a).unwrap();
    assert_eq!(driver.contents(&handle_a), Some(&[1u8, 2, 3, 4][..]));
}

#[test]
fn test_replayed_calls_follow_dependency_order() {
    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::new(ContextId(0));
    ctx.enable_tracking().unwrap();
    let fb = ctx.create_resource(ResourceKind::Framebuffer, &mut driver).unwrap();
    let tex = ctx.create_resource(ResourceKind::Texture, &mut driver).unwrap();
    ctx.dispatch(
        Call::FramebufferParameter {
            pname: 0x9310,
            param: 32,
            framebuffer: fb,
        },
        &mut driver,
    )
    .unwrap();
    ctx.dispatch(storage(tex), &mut driver).unwrap();
    ctx.dispatch(attach(fb, tex), &mut driver).unwrap();
    let snapshot = ctx.snapshot(&mut driver).unwrap();

    let mut replay_ctx = fresh_context(RcapConfig::default());
    let mut replay_driver = NullDriver::with_first_name(ContextId(0), 500);
    replay_ctx.replay(&snapshot.bytes, &mut replay_driver).unwrap();

    // The texture's block comes first although its id is higher.
    let order: Vec<ChunkType> = replay_driver.log().iter().map(Call::chunk_type).collect();
    assert_eq!(
        order,
        vec![
            ChunkType::TextureStorage,
            ChunkType::FramebufferParameter,
            ChunkType::FramebufferTexture2D
        ]
    );
}

#[test]
fn test_replay_frame_reruns_frame() {
    let captured = capture_scene();
    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::with_first_name(ContextId(0), 1000);
    ctx.replay(&captured.bytes, &mut driver).unwrap();

    let before = driver.log().len();
    assert_eq!(ctx.replay_frame(&mut driver).unwrap(), 2);
    assert_eq!(ctx.replay_frame(&mut driver).unwrap(), 2);
    assert_eq!(driver.log().len(), before + 4);
    assert!(matches!(driver.log().last(), Some(Call::Draw { count: 6, .. })));

    ctx.end_replay().unwrap();
    assert!(matches!(
        ctx.replay_frame(&mut driver),
        Err(CaptureError::WrongState { .. })
    ));
}

#[test]
fn test_release_replay_destroys_resources() {
    let captured = capture_scene();
    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::with_first_name(ContextId(0), 1000);
    ctx.replay(&captured.bytes, &mut driver).unwrap();
    assert_eq!(driver.live_count(), 4);

    // Only once replay has ended.
    assert!(matches!(
        ctx.release_replay(&mut driver),
        Err(CaptureError::WrongState { .. })
    ));
    ctx.end_replay().unwrap();
    // Resources outlive end_replay.
    assert_eq!(driver.live_count(), 4);

    ctx.release_replay(&mut driver).unwrap();
    assert_eq!(driver.live_count(), 0);
    assert!(!ctx.shared().ids().contains(captured.ids[0]));
    assert!(ctx.replayed_graph().is_none());
}

#[test]
fn test_second_replay_replaces_first() {
    let captured = capture_scene();
    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::with_first_name(ContextId(0), 1000);
    ctx.replay(&captured.bytes, &mut driver).unwrap();
    ctx.end_replay().unwrap();

    ctx.replay(&captured.bytes, &mut driver).unwrap();
    assert_eq!(driver.live_count(), 4);
    let live = ctx.shared().ids().resolve(captured.ids[0]).unwrap();
    assert!(live.name >= 1004);
}

#[test]
fn test_unknown_chunk_skipped() {
    let tex = ResourceId(2);
    let bytes = capture_of(&[
        Call::GenTexture { id: tex }.encode(),
        Chunk::from_raw(0xBEEF, vec![0xAA; 12]),
        storage(tex).encode(),
    ]);

    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::new(ContextId(0));
    let report = ctx.replay(&bytes, &mut driver).unwrap();
    assert_eq!(report.skipped_chunks, 1);
    assert_eq!(report.resources, 1);
    assert_eq!(report.calls, 1);
    assert_eq!(report.frame_number, None);
    assert_eq!(driver.log(), &[storage(tex)]);
}

#[test]
fn test_unknown_chunk_rejected_when_strict() {
    let bytes = capture_of(&[
        Call::GenTexture { id: ResourceId(2) }.encode(),
        Chunk::from_raw(0xBEEF, Vec::new()),
    ]);

    let mut config = RcapConfig::default();
    config.replay.skip_unknown_chunks = false;
    let mut ctx = fresh_context(config);
    let mut driver = NullDriver::new(ContextId(0));
    assert!(matches!(
        ctx.replay(&bytes, &mut driver),
        Err(CaptureError::MalformedChunk { opcode: 0xBEEF, .. })
    ));
    assert_eq!(ctx.state(), CaptureState::IdleExecute);
}

#[test]
fn test_malformed_chunk_aborts_replay() {
    // Two 16-byte creation chunks, then a storage call cut down to three bytes.
    let bytes = capture_of(&[
        Call::GenTexture { id: ResourceId(2) }.encode(),
        Call::GenFramebuffer { id: ResourceId(3) }.encode(),
        Chunk::from_raw(ChunkType::TextureStorage.opcode(), vec![1, 2, 3]),
    ]);

    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::new(ContextId(0));
    let err = ctx.replay(&bytes, &mut driver).unwrap_err();
    // DeviceInit takes the first 20 bytes.
    assert!(matches!(
        err,
        CaptureError::MalformedChunk { opcode: 0x0110, offset: 52, .. }
    ));
    assert_eq!(ctx.state(), CaptureState::IdleExecute);
    assert_eq!(driver.live_count(), 0);
    assert!(!ctx.shared().ids().contains(ResourceId(2)));
    assert!(ctx.replayed_graph().is_none());
}

#[test]
fn test_unresolved_id_releases_created_resources() {
    let bytes = capture_of(&[
        Call::GenTexture { id: ResourceId(2) }.encode(),
        Call::GenTexture { id: ResourceId(3) }.encode(),
        storage(ResourceId(9)).encode(),
    ]);

    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::new(ContextId(0));
    assert!(matches!(
        ctx.replay(&bytes, &mut driver),
        Err(CaptureError::ResourceNotFound(ResourceId(9)))
    ));
    assert_eq!(driver.live_count(), 0);
    assert!(!ctx.shared().ids().contains(ResourceId(2)));
    assert!(!ctx.shared().ids().contains(ResourceId(3)));
    assert!(ctx.shared().tables().texture(ResourceId(2)).is_none());
    assert_eq!(ctx.state(), CaptureState::IdleExecute);
}

#[test]
fn test_deletions_and_duplicate_creations_ignored() {
    let tex = ResourceId(2);
    let bytes = capture_of(&[
        Call::GenTexture { id: tex }.encode(),
        Call::GenTexture { id: tex }.encode(),
        Call::DeleteResource { id: tex }.encode(),
    ]);

    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::new(ContextId(0));
    let report = ctx.replay(&bytes, &mut driver).unwrap();
    assert_eq!(report.resources, 1);
    assert_eq!(report.calls, 0);
    assert_eq!(driver.live_count(), 1);
}

#[test]
fn test_replay_requires_idle_execute() {
    let captured = capture_scene();
    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::new(ContextId(0));
    ctx.enable_tracking().unwrap();
    assert!(matches!(
        ctx.replay(&captured.bytes, &mut driver),
        Err(CaptureError::InvalidTransition {
            from: CaptureState::IdleRecord,
            to: CaptureState::ReplayDecode,
        })
    ));
    assert_eq!(driver.live_count(), 0);
}

#[test]
fn test_bad_file_is_a_stream_error() {
    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::new(ContextId(0));
    assert!(matches!(
        ctx.replay(b"not a capture", &mut driver),
        Err(CaptureError::Stream(_))
    ));
    assert_eq!(ctx.state(), CaptureState::IdleExecute);
}

#[test]
fn test_frame_uses_resources_created_before_tracking() {
    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::new(ContextId(0));
    let fb = ctx.create_resource(ResourceKind::Framebuffer, &mut driver).unwrap();
    let tex = ctx.create_resource(ResourceKind::Texture, &mut driver).unwrap();
    ctx.dispatch(storage(tex), &mut driver).unwrap();
    ctx.dispatch(attach(fb, tex), &mut driver).unwrap();
    assert!(!ctx.graph().contains(fb));

    ctx.enable_tracking().unwrap();
    ctx.begin_frame(&mut driver).unwrap();
    ctx.dispatch(bind(fb), &mut driver).unwrap();
    ctx.dispatch(draw(), &mut driver).unwrap();
    let snapshot = ctx.end_frame(&mut driver).unwrap();

    // The framebuffer comes with the attachment it already had.
    let edges: Vec<_> = ctx.graph().edges().into_iter().collect();
    assert_eq!(edges, vec![(fb, tex)]);

    let mut replay_ctx = fresh_context(RcapConfig::default());
    let mut replay_driver = NullDriver::with_first_name(ContextId(0), 1000);
    let report = replay_ctx.replay(&snapshot.bytes, &mut replay_driver).unwrap();
    assert_eq!(report.resources, 2);
    assert_eq!(report.frame_calls, 2);

    let replayed: Vec<_> = replay_ctx.replayed_graph().unwrap().edges().into_iter().collect();
    assert_eq!(replayed, vec![(fb, tex)]);
    assert_eq!(
        replay_ctx.shared().tables().framebuffer(fb).unwrap().attachments[&attachment::COLOR0],
        tex
    );
}

#[test]
fn test_adopted_texture_keeps_contents_from_before_the_write() {
    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::new(ContextId(0));
    let tex = ctx.create_resource(ResourceKind::Texture, &mut driver).unwrap();
    ctx.dispatch(sub_image(tex, 1), &mut driver).unwrap();

    ctx.enable_tracking().unwrap();
    ctx.begin_frame(&mut driver).unwrap();
    ctx.dispatch(sub_image(tex, 7), &mut driver).unwrap();
    let snapshot = ctx.end_frame(&mut driver).unwrap();
    assert_eq!(initial_contents(&snapshot.bytes), vec![(tex, vec![1u8; 4])]);

    let mut replay_ctx = fresh_context(RcapConfig::default());
    let mut replay_driver = NullDriver::with_first_name(ContextId(0), 1000);
    let report = replay_ctx.replay(&snapshot.bytes, &mut replay_driver).unwrap();
    assert_eq!(report.contents_applied, 1);
    assert_eq!(report.frame_calls, 1);
    let live = replay_ctx.shared().ids().resolve(tex).unwrap();
    assert_eq!(replay_driver.contents(&live), Some(&[7u8; 4][..]));
}

#[test]
fn test_resource_deleted_during_frame_is_still_captured() {
    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::new(ContextId(0));
    ctx.enable_tracking().unwrap();
    let fb = ctx.create_resource(ResourceKind::Framebuffer, &mut driver).unwrap();

    ctx.begin_frame(&mut driver).unwrap();
    ctx.dispatch(bind(fb), &mut driver).unwrap();
    ctx.dispatch(draw(), &mut driver).unwrap();
    ctx.dispatch(Call::DeleteResource { id: fb }, &mut driver).unwrap();
    // The record outlives the native object until the frame is written.
    assert!(ctx.graph().contains(fb));
    assert!(!ctx.shared().ids().contains(fb));

    let snapshot = ctx.end_frame(&mut driver).unwrap();
    assert!(!ctx.graph().contains(fb));
    assert_eq!(snapshot.frame_chunks, 2);

    let mut replay_ctx = fresh_context(RcapConfig::default());
    let mut replay_driver = NullDriver::with_first_name(ContextId(0), 1000);
    let report = replay_ctx.replay(&snapshot.bytes, &mut replay_driver).unwrap();
    assert_eq!(report.resources, 1);
    assert_eq!(report.frame_calls, 2);
    assert!(matches!(replay_driver.log().first(), Some(Call::BindFramebuffer { .. })));
}

#[test]
fn test_texture_created_during_frame_has_no_initial_contents() {
    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::new(ContextId(0));
    ctx.enable_tracking().unwrap();

    ctx.begin_frame(&mut driver).unwrap();
    let tex = ctx.create_resource(ResourceKind::Texture, &mut driver).unwrap();
    ctx.dispatch(storage(tex), &mut driver).unwrap();
    ctx.dispatch(sub_image(tex, 9), &mut driver).unwrap();
    ctx.dispatch(draw(), &mut driver).unwrap();
    let snapshot = ctx.end_frame(&mut driver).unwrap();
    assert!(initial_contents(&snapshot.bytes).is_empty());

    let mut replay_ctx = fresh_context(RcapConfig::default());
    let mut replay_driver = NullDriver::with_first_name(ContextId(0), 1000);
    let report = replay_ctx.replay(&snapshot.bytes, &mut replay_driver).unwrap();
    assert_eq!(report.resources, 1);
    assert_eq!(report.contents_applied, 0);
    // The repeated creation inside the frame is not reissued.
    assert_eq!(report.frame_calls, 3);
    let live = replay_ctx.shared().ids().resolve(tex).unwrap();
    assert_eq!(replay_driver.contents(&live), Some(&[9u8; 4][..]));
}

#[test]
fn test_block_chunk_count_must_match() {
    let tex = ResourceId(2);
    // Declares three chunks, two follow.
    let short = capture_of(&[
        block_header(tex, ResourceKind::Texture, 3),
        Call::GenTexture { id: tex }.encode(),
        storage(tex).encode(),
    ]);
    // Declares one chunk, two follow.
    let long = capture_of(&[
        block_header(tex, ResourceKind::Texture, 1),
        Call::GenTexture { id: tex }.encode(),
        storage(tex).encode(),
    ]);

    for bytes in [short, long] {
        let mut ctx = fresh_context(RcapConfig::default());
        let mut driver = NullDriver::new(ContextId(0));
        let err = ctx.replay(&bytes, &mut driver).unwrap_err();
        assert!(
            matches!(err, CaptureError::MalformedChunk { opcode: 0x0002, offset: 20, .. }),
            "unexpected error: {:?}",
            err
        );
        assert_eq!(driver.live_count(), 0);
        assert_eq!(ctx.state(), CaptureState::IdleExecute);
    }
}

#[test]
fn test_block_must_start_with_its_creation() {
    let bytes = capture_of(&[
        block_header(ResourceId(2), ResourceKind::Texture, 1),
        Call::GenFramebuffer { id: ResourceId(2) }.encode(),
    ]);
    let mut ctx = fresh_context(RcapConfig::default());
    let mut driver = NullDriver::new(ContextId(0));
    let err = ctx.replay(&bytes, &mut driver).unwrap_err();
    assert!(matches!(
        err,
        CaptureError::MalformedChunk { opcode, .. } if opcode == ChunkType::GenFramebuffer.opcode()
    ));
}

#[test]
fn test_frame_framing_checked() {
    // Frame declares two calls, one follows.
    let short = capture_of(&[
        frame_begin(1, 2),
        draw().encode(),
        ChunkWriter::new(ChunkType::FrameEnd).finish(),
    ]);
    // Frame never ends.
    let open = capture_of(&[frame_begin(1, 1), draw().encode()]);

    for bytes in [short, open] {
        let mut ctx = fresh_context(RcapConfig::default());
        let mut driver = NullDriver::new(ContextId(0));
        assert!(matches!(
            ctx.replay(&bytes, &mut driver),
            Err(CaptureError::MalformedChunk { opcode: 0x0004, offset: 20, .. })
        ));
        assert_eq!(driver.log().len(), 0);
    }
}
