pub mod config;
pub mod context;
pub mod dirty;
pub mod driver;
pub mod error;
pub mod identity;
pub mod record;
pub mod replay;
pub mod side_table;
pub mod snapshot;
pub mod state;

pub use config::RcapConfig;
pub use context::{Bindings, CaptureContext, FrameCapture, SharedResources};
pub use driver::{Driver, LiveArgs, NullDriver};
pub use error::{CaptureError, DriverError, Result};
pub use identity::IdentityMap;
pub use record::{RecordGraph, ResourceRecord};
pub use replay::ReplayReport;
pub use side_table::{FramebufferData, SideTables, TextureData, TextureUsage};
pub use snapshot::Snapshot;
pub use state::{CaptureState, Route, StateMachine};
