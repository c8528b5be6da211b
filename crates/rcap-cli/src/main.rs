use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use rcap_core::config::{default_config_path, RcapConfig};
use rcap_core::{CaptureContext, NullDriver, SharedResources};
use rcap_protocol::calls::{attachment, target};
use rcap_protocol::opcode::opcode_name;
use rcap_protocol::stream::{decode_capture, encode_capture, ChunkStream, StreamFlags};
use rcap_protocol::{Call, ContextId, ResourceKind};

#[derive(Parser)]
#[command(name = "rcap")]
#[command(about = "rcap - capture file inspection and replay")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the header and a summary of a capture file
    Info {
        /// Capture file
        file: String,
    },

    /// List every chunk of a capture file
    Dump {
        /// Capture file
        file: String,

        /// Print one JSON object per chunk
        #[arg(long)]
        json: bool,
    },

    /// Replay a capture file against the in-memory driver
    Replay {
        /// Capture file
        file: String,

        /// How many times to re-run the captured frame after decoding
        #[arg(short, long, default_value_t = 1)]
        frames: u32,
    },

    /// Re-frame a capture file without interpreting its chunks
    Passthrough {
        /// Input capture file
        input: String,

        /// Output capture file
        output: String,

        /// Compress the output payload
        #[arg(long)]
        compress: bool,
    },

    /// Write a small capture of one texture rendered through one framebuffer
    Sample {
        /// Output capture file
        output: String,
    },
}

#[derive(Serialize)]
struct ChunkEntry {
    offset: u64,
    opcode: u32,
    name: String,
    length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    call: Option<String>,
}

fn main() -> anyhow::Result<()> {
    rcap_common::init_logging_with_default("warn");

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = RcapConfig::load_or_default(&config_path);

    match cli.command {
        Commands::Info { file } => {
            let bytes = std::fs::read(&file)?;
            let (header, payload) = decode_capture(&bytes)?;

            let mut chunks = 0usize;
            let mut unknown = 0usize;
            let mut blocks = 0usize;
            for raw in ChunkStream::with_limit(&payload, config.replay.max_chunk_size) {
                let raw = raw?;
                chunks += 1;
                match raw.chunk_type() {
                    None => unknown += 1,
                    Some(rcap_protocol::ChunkType::ResourceBlock) => blocks += 1,
                    Some(_) => {}
                }
            }

            println!("Capture file {}", file);
            println!("  Version:     {}", header.version);
            println!("  Compressed:  {}", header.flags.contains(StreamFlags::COMPRESSED));
            println!("  Has frame:   {}", header.flags.contains(StreamFlags::HAS_FRAME));
            println!("  File size:   {} bytes", bytes.len());
            println!("  Payload:     {} bytes", payload.len());
            println!("  Chunks:      {}", chunks);
            println!("  Resources:   {}", blocks);
            if unknown > 0 {
                println!("  Unknown:     {}", unknown);
            }
        }

        Commands::Dump { file, json } => {
            let bytes = std::fs::read(&file)?;
            let (_, payload) = decode_capture(&bytes)?;

            for raw in ChunkStream::with_limit(&payload, config.replay.max_chunk_size) {
                let raw = raw?;
                let call = raw
                    .chunk_type()
                    .and_then(|ty| Call::decode(ty, raw.payload).ok())
                    .map(|call| format!("{:?}", call));
                let entry = ChunkEntry {
                    offset: raw.offset,
                    opcode: raw.opcode,
                    name: opcode_name(raw.opcode),
                    length: raw.payload.len(),
                    call,
                };
                if json {
                    println!("{}", serde_json::to_string(&entry)?);
                } else {
                    println!(
                        "{:>8}  {:#06x}  {:<32} {:>6} B  {}",
                        entry.offset,
                        entry.opcode,
                        entry.name,
                        entry.length,
                        entry.call.unwrap_or_default()
                    );
                }
            }
        }

        Commands::Replay { file, frames } => {
            let bytes = std::fs::read(&file)?;
            let shared = Arc::new(SharedResources::new());
            let mut driver = NullDriver::new(ContextId(0));
            let mut ctx = CaptureContext::new(ContextId(0), shared, config)?;

            let report = ctx.replay(&bytes, &mut driver)?;
            for _ in 0..frames {
                ctx.replay_frame(&mut driver)?;
            }
            ctx.end_replay()?;

            println!("Replayed {}", file);
            println!("  Resources created: {}", report.resources);
            println!("  Calls issued:      {}", report.calls);
            println!("  Contents applied:  {}", report.contents_applied);
            if let Some(number) = report.frame_number {
                println!("  Frame:             #{} ({} calls, re-run {}x)", number, report.frame_calls, frames);
            }
            if report.skipped_chunks > 0 {
                println!("  Skipped chunks:    {}", report.skipped_chunks);
            }
            if let Some(graph) = ctx.replayed_graph() {
                println!("  Dependencies:");
                for (child, parent) in graph.edges() {
                    println!("    {} -> {}", child, parent);
                }
            }
            ctx.release_replay(&mut driver)?;
        }

        Commands::Passthrough {
            input,
            output,
            compress,
        } => {
            let bytes = std::fs::read(&input)?;
            let (header, payload) = decode_capture(&bytes)?;

            // Walk the framing once so a damaged file is not copied silently.
            let mut chunks = 0usize;
            for raw in ChunkStream::with_limit(&payload, config.replay.max_chunk_size) {
                raw?;
                chunks += 1;
            }

            let threshold = compress.then_some(config.capture.compression_threshold);
            let out = encode_capture(&payload, header.flags, threshold)?;
            std::fs::write(&output, &out)?;
            info!("copied {} chunk(s) from {} to {}", chunks, input, output);
            println!("Wrote {} ({} bytes, {} chunks)", output, out.len(), chunks);
        }

        Commands::Sample { output } => {
            let shared = Arc::new(SharedResources::new());
            let mut driver = NullDriver::new(ContextId(0));
            let mut ctx = CaptureContext::new(ContextId(0), shared, config)?;
            ctx.enable_tracking()?;

            let texture = ctx.create_resource(ResourceKind::Texture, &mut driver)?;
            ctx.dispatch(
                Call::TextureStorage {
                    texture,
                    target: 0x0DE1,
                    levels: 1,
                    internal_format: 0x8058,
                    width: 256,
                    height: 256,
                    depth: 1,
                    samples: 1,
                },
                &mut driver,
            )?;
            let framebuffer = ctx.create_resource(ResourceKind::Framebuffer, &mut driver)?;
            ctx.dispatch(
                Call::FramebufferTexture2D {
                    attachment: attachment::COLOR0,
                    texture,
                    textarget: 0x0DE1,
                    level: 0,
                    framebuffer,
                },
                &mut driver,
            )?;

            ctx.begin_frame(&mut driver)?;
            ctx.dispatch(
                Call::BindFramebuffer {
                    target: target::FRAMEBUFFER,
                    framebuffer,
                },
                &mut driver,
            )?;
            ctx.dispatch(
                Call::Draw {
                    mode: 0x0004,
                    first: 0,
                    count: 3,
                },
                &mut driver,
            )?;
            let snapshot = ctx.end_frame(&mut driver)?;

            std::fs::write(&output, &snapshot.bytes)?;
            println!("Wrote {} ({} bytes)", output, snapshot.bytes.len());
        }
    }
    Ok(())
}
