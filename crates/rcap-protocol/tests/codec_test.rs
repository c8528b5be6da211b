//! Chunk codec and call catalog tests.
//!
//! Run with: cargo test -p rcap-protocol --test codec_test

use rcap_protocol::calls::attachment;
use rcap_protocol::opcode::opcode_name;
use rcap_protocol::{
    Call, CallScope, Chunk, ChunkReader, ChunkType, ChunkWriter, CodecError, ResourceId,
    ResourceKind,
};

#[test]
fn test_fields_read_back_in_write_order() {
    let mut w = ChunkWriter::new(ChunkType::TextureStorage);
    w.put(&7u8)
        .put(&0xBEEFu16)
        .put(&-3i32)
        .put(&ResourceId(42))
        .put(&true)
        .put(&1.5f32)
        .put(&[1u32, 2, 3])
        .put(&vec![10u16, 20])
        .put(&"rt0".to_string());
    let chunk = w.finish();
    assert_eq!(chunk.opcode(), ChunkType::TextureStorage.opcode());

    let mut r = chunk.expect(ChunkType::TextureStorage).unwrap();
    assert_eq!(r.get::<u8>().unwrap(), 7);
    assert_eq!(r.get::<u16>().unwrap(), 0xBEEF);
    assert_eq!(r.get::<i32>().unwrap(), -3);
    assert_eq!(r.get::<ResourceId>().unwrap(), ResourceId(42));
    assert!(r.get::<bool>().unwrap());
    assert_eq!(r.get::<f32>().unwrap(), 1.5);
    assert_eq!(r.get::<[u32; 3]>().unwrap(), [1, 2, 3]);
    assert_eq!(r.get::<Vec<u16>>().unwrap(), vec![10, 20]);
    assert_eq!(r.get::<String>().unwrap(), "rt0");
    r.finish().unwrap();
}

#[test]
fn test_little_endian_layout() {
    let mut w = ChunkWriter::with_opcode(0x1234);
    w.put(&0x0102_0304u32).put(&vec![0xAAu8, 0xBB]);
    let chunk = w.finish();
    assert_eq!(
        chunk.payload(),
        &[0x04, 0x03, 0x02, 0x01, 2, 0, 0, 0, 0xAA, 0xBB]
    );

    let mut framed = Vec::new();
    chunk.write_to(&mut framed);
    assert_eq!(&framed[..4], &0x1234u32.to_le_bytes());
    assert_eq!(&framed[4..8], &10u32.to_le_bytes());
    assert_eq!(framed.len(), chunk.encoded_len());
}

#[test]
fn test_trailing_bytes_rejected() {
    let mut w = ChunkWriter::new(ChunkType::DrawBuffer);
    w.put(&1u32).put(&2u32);
    let chunk = w.finish();

    let mut r = chunk.reader();
    r.get::<u32>().unwrap();
    assert_eq!(r.finish(), Err(CodecError::TrailingBytes(4)));
    assert_eq!(Call::from_chunk(&chunk), Err(CodecError::TrailingBytes(4)));
}

#[test]
fn test_truncated_field() {
    let mut r = ChunkReader::new(&[1, 2, 3]);
    assert_eq!(
        r.get::<u32>(),
        Err(CodecError::Truncated {
            needed: 4,
            remaining: 3
        })
    );
}

#[test]
fn test_array_count_bounded_by_payload() {
    // Claims four billion u32 elements with eight bytes behind the count.
    let mut w = ChunkWriter::with_opcode(1);
    w.put(&u32::MAX).put(&0u64);
    let chunk = w.finish();

    let mut r = chunk.reader();
    assert_eq!(
        r.get::<Vec<u32>>(),
        Err(CodecError::ArrayTooLong {
            count: u32::MAX,
            remaining: 8
        })
    );
}

#[test]
fn test_invalid_bool_and_kind() {
    let mut r = ChunkReader::new(&[2]);
    assert_eq!(r.get::<bool>(), Err(CodecError::InvalidBool(2)));

    let bytes = 9u32.to_le_bytes();
    let mut r = ChunkReader::new(&bytes);
    assert_eq!(r.get::<ResourceKind>(), Err(CodecError::InvalidKind(9)));
}

#[test]
fn test_opcode_mismatch() {
    let chunk = Call::GenTexture { id: ResourceId(1) }.encode();
    assert!(matches!(
        chunk.expect(ChunkType::GenBuffer),
        Err(CodecError::OpcodeMismatch { .. })
    ));
}

#[test]
fn test_call_decodes_from_its_own_chunk() {
    let calls = [
        Call::FramebufferTexture2D {
            attachment: attachment::COLOR0,
            texture: ResourceId(3),
            textarget: 0x0DE1,
            level: 0,
            framebuffer: ResourceId(9),
        },
        Call::TextureSubImage {
            texture: ResourceId(3),
            level: 1,
            offset: [0, 4, 0],
            extent: [16, 16, 1],
            format: 0x1908,
            data: vec![0xFF; 64],
        },
        Call::BlitFramebuffer {
            src: [0, 0, 64, 64],
            dst: [0, 0, 128, 128],
            mask: 0x4000,
            filter: 0x2601,
        },
        Call::InvalidateFramebuffer {
            framebuffer: ResourceId(9),
            attachments: vec![attachment::COLOR0, attachment::DEPTH],
        },
    ];
    for call in calls {
        let chunk = call.encode();
        assert_eq!(chunk.chunk_type(), Some(call.chunk_type()));
        assert_eq!(Call::from_chunk(&chunk).unwrap(), call);
    }
}

#[test]
fn test_multisample_storage_field_order() {
    let call = Call::RenderbufferStorageMultisample {
        internal_format: 0x88F0,
        samples: 4,
        width: 640,
        height: 480,
        renderbuffer: ResourceId(5),
    };
    let chunk = call.encode();
    let p = chunk.payload();
    assert_eq!(&p[0..4], &0x88F0u32.to_le_bytes());
    assert_eq!(&p[4..8], &4u32.to_le_bytes());
    assert_eq!(&p[8..12], &640u32.to_le_bytes());
    assert_eq!(&p[12..16], &480u32.to_le_bytes());
    assert_eq!(&p[16..24], &5u64.to_le_bytes());
}

#[test]
fn test_resource_ids_skip_null_and_duplicates() {
    let call = Call::FramebufferTexture {
        attachment: attachment::COLOR0,
        texture: ResourceId(4),
        level: 0,
        framebuffer: ResourceId(4),
    };
    assert_eq!(call.resource_ids(), vec![ResourceId(4)]);

    let call = Call::BindFramebuffer {
        target: 0x8D40,
        framebuffer: ResourceId::null(),
    };
    assert!(call.resource_ids().is_empty());
}

#[test]
fn test_attachment_and_target() {
    let call = Call::FramebufferRenderbuffer {
        framebuffer: ResourceId(2),
        attachment: attachment::DEPTH_STENCIL,
        renderbuffer_target: 0x8D41,
        renderbuffer: ResourceId(7),
    };
    let a = call.attachment().unwrap();
    assert_eq!(a.framebuffer, ResourceId(2));
    assert_eq!(a.slot, attachment::DEPTH_STENCIL);
    assert_eq!(a.resource, ResourceId(7));
    assert_eq!(call.target(), ResourceId(2));

    let draw = Call::Draw {
        mode: 4,
        first: 0,
        count: 3,
    };
    assert!(draw.attachment().is_none());
    assert!(draw.target().is_null());
}

#[test]
fn test_creation_calls_match_kinds() {
    for kind in [
        ResourceKind::Texture,
        ResourceKind::Framebuffer,
        ResourceKind::Renderbuffer,
        ResourceKind::Buffer,
    ] {
        let call = Call::creation(kind, ResourceId(11)).unwrap();
        assert_eq!(call.created(), Some((ResourceId(11), kind)));
        assert_eq!(call.scope(), CallScope::Creation);
    }
    assert!(Call::creation(ResourceKind::Device, ResourceId(1)).is_none());
}

#[test]
fn test_catalog_is_consistent() {
    let mut opcodes: Vec<u32> = ChunkType::ALL.iter().map(|t| t.opcode()).collect();
    opcodes.sort_unstable();
    opcodes.dedup();
    assert_eq!(opcodes.len(), ChunkType::ALL.len(), "duplicate opcode");

    for ty in ChunkType::ALL {
        assert_eq!(ChunkType::from_raw(ty.opcode()), Some(*ty));
        assert_eq!(opcode_name(ty.opcode()), ty.name());
    }

    let coalescing: Vec<ChunkType> = ChunkType::ALL
        .iter()
        .copied()
        .filter(|t| t.coalesces())
        .collect();
    assert_eq!(coalescing, vec![ChunkType::ReadBuffer]);

    assert_eq!(ChunkType::BlitFramebuffer.scope(), CallScope::Frame);
    assert_eq!(ChunkType::FramebufferTexture.scope(), CallScope::Resource);
    assert_eq!(opcode_name(0xBEEF), "Unknown(0xbeef)");
}

#[test]
fn test_structure_chunks_are_not_calls() {
    let chunk = Chunk::from_raw(ChunkType::FrameEnd.opcode(), Vec::new());
    assert_eq!(
        Call::from_chunk(&chunk),
        Err(CodecError::NotACall(ChunkType::FrameEnd.opcode()))
    );
    let chunk = Chunk::from_raw(0xBEEF, Vec::new());
    assert_eq!(Call::from_chunk(&chunk), Err(CodecError::UnknownOpcode(0xBEEF)));
}
