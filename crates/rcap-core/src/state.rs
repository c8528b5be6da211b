use rcap_protocol::CallScope;
use tracing::info;

use crate::error::{CaptureError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    /// Real calls only, nothing recorded.
    #[default]
    IdleExecute,
    /// Real calls executed, resource-scoped side effects recorded into records.
    IdleRecord,
    /// Every call additionally serialized into the active frame, in call order.
    FrameCapture,
    /// Chunks are read from a stream and reissued with identifier remapping.
    ReplayDecode,
    /// Already decoded operations are reissued verbatim.
    ReplayExecute,
}

impl CaptureState {
    pub fn is_recording(self) -> bool {
        matches!(self, Self::IdleRecord | Self::FrameCapture)
    }

    pub fn is_replaying(self) -> bool {
        matches!(self, Self::ReplayDecode | Self::ReplayExecute)
    }
}

/// Where one intercepted call's serialized form goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Route {
    /// Append to the owning resource's record (or the device record).
    pub record: bool,
    /// Append to the active frame capture.
    pub frame: bool,
    /// Feed the dirty tracker.
    pub track: bool,
}

/// The per-context capture mode.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: CaptureState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Decide what happens to a call, from the current state and the call's static
    /// scope alone.
    pub fn route(&self, scope: CallScope) -> Route {
        use CallScope::*;
        use CaptureState::*;

        let (record, frame, track) = match (self.state, scope) {
            (IdleRecord, Creation | Resource) => (true, false, false),
            (IdleRecord, Content | Tracking) => (false, false, true),
            (FrameCapture, Creation | Resource) => (true, true, false),
            (FrameCapture, Content) => (false, true, true),
            (FrameCapture, Frame) => (false, true, false),
            (FrameCapture, Tracking) => (false, false, true),
            _ => (false, false, false),
        };
        Route {
            record,
            frame,
            track,
        }
    }

    pub fn enable_tracking(&mut self) -> Result<()> {
        self.transition(CaptureState::IdleExecute, CaptureState::IdleRecord)
    }

    pub fn disable_tracking(&mut self) -> Result<()> {
        self.transition(CaptureState::IdleRecord, CaptureState::IdleExecute)
    }

    pub fn begin_frame(&mut self) -> Result<()> {
        self.transition(CaptureState::IdleRecord, CaptureState::FrameCapture)
    }

    pub fn end_frame(&mut self) -> Result<()> {
        self.transition(CaptureState::FrameCapture, CaptureState::IdleRecord)
    }

    pub fn begin_replay(&mut self) -> Result<()> {
        self.transition(CaptureState::IdleExecute, CaptureState::ReplayDecode)
    }

    pub fn finish_decode(&mut self) -> Result<()> {
        self.transition(CaptureState::ReplayDecode, CaptureState::ReplayExecute)
    }

    pub fn end_replay(&mut self) -> Result<()> {
        self.transition(CaptureState::ReplayExecute, CaptureState::IdleExecute)
    }

    /// Leave either replay state after a failure.
    pub fn abort_replay(&mut self) -> Result<()> {
        if !self.state.is_replaying() {
            return Err(CaptureError::InvalidTransition {
                from: self.state,
                to: CaptureState::IdleExecute,
            });
        }
        info!("capture state: {:?} -> IdleExecute (aborted)", self.state);
        self.state = CaptureState::IdleExecute;
        Ok(())
    }

    pub fn expect(&self, expected: CaptureState) -> Result<()> {
        if self.state != expected {
            return Err(CaptureError::WrongState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    fn transition(&mut self, from: CaptureState, to: CaptureState) -> Result<()> {
        if self.state != from {
            return Err(CaptureError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        info!("capture state: {:?} -> {:?}", from, to);
        self.state = to;
        Ok(())
    }
}
