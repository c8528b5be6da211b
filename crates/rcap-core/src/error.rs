use rcap_protocol::{CodecError, LiveHandle, ResourceId, StreamError};

use crate::state::CaptureState;

/// A failure reported by the native driver. Passed through untouched: the core
/// never interprets native error codes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("driver error: code={code}, message={message}")]
pub struct DriverError {
    pub code: i32,
    pub message: String,
}

impl DriverError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceId),

    #[error("adding {parent} as parent of {child} would create a cycle")]
    CyclicDependency { child: ResourceId, parent: ResourceId },

    #[error("malformed chunk {opcode:#06x} at offset {offset}: {reason}")]
    MalformedChunk {
        opcode: u32,
        offset: u64,
        reason: String,
    },

    #[error("{handle} is already registered as {existing}, cannot register it as {requested}")]
    DuplicateRegistration {
        handle: LiveHandle,
        existing: ResourceId,
        requested: ResourceId,
    },

    #[error("{id} is still a parent of {children} live record(s)")]
    StillReferenced { id: ResourceId, children: usize },

    #[error("no resource record for {0}")]
    RecordNotFound(ResourceId),

    #[error("invalid capture state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: CaptureState, to: CaptureState },

    #[error("operation requires state {expected:?}, current state is {actual:?}")]
    WrongState {
        expected: CaptureState,
        actual: CaptureState,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = CaptureError> = std::result::Result<T, E>;
