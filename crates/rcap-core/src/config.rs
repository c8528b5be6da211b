use serde::{Deserialize, Serialize};

use rcap_protocol::stream::{DEFAULT_COMPRESSION_THRESHOLD, DEFAULT_MAX_CHUNK_SIZE};

use crate::error::{CaptureError, Result};

/// Top-level rcap configuration, loaded from rcap.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RcapConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Start new contexts in IdleRecord instead of IdleExecute
    #[serde(default)]
    pub track_on_start: bool,
    /// LZ4-compress capture payloads
    #[serde(default = "default_true")]
    pub compress: bool,
    /// Payloads at or below this size are stored uncompressed
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
    /// Read back resource contents for dirty records when snapshotting
    #[serde(default = "default_true")]
    pub initial_contents: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Skip chunks with unrecognized opcodes instead of failing the replay
    #[serde(default = "default_true")]
    pub skip_unknown_chunks: bool,
    /// Largest chunk payload accepted when reading a capture
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            track_on_start: false,
            compress: true,
            compression_threshold: default_compression_threshold(),
            initial_contents: true,
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            skip_unknown_chunks: true,
            max_chunk_size: default_max_chunk_size(),
        }
    }
}

impl CaptureConfig {
    /// Threshold to hand to the stream encoder, `None` when compression is off.
    pub fn compression(&self) -> Option<usize> {
        self.compress.then_some(self.compression_threshold)
    }
}

impl RcapConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| CaptureError::Config(e.to_string()))
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        Self::load(path).unwrap_or_default()
    }
}

/// Returns the default config file path based on platform conventions.
/// Search order:
/// 1. System-wide config: `%PROGRAMDATA%\RCAP\rcap.toml` (Windows) or `/etc/rcap/rcap.toml` (Linux/macOS)
/// 2. Local fallback: `./rcap.toml`
pub fn default_config_path() -> String {
    #[cfg(windows)]
    {
        let programdata = std::env::var("PROGRAMDATA")
            .unwrap_or_else(|_| r"C:\ProgramData".to_string());
        let system_path = format!(r"{}\RCAP\rcap.toml", programdata);
        if std::path::Path::new(&system_path).exists() {
            return system_path;
        }
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/rcap/rcap.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "rcap.toml".to_string()
}

fn default_compression_threshold() -> usize {
    DEFAULT_COMPRESSION_THRESHOLD
}

fn default_max_chunk_size() -> u32 {
    DEFAULT_MAX_CHUNK_SIZE
}

fn default_true() -> bool {
    true
}
