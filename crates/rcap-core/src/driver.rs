//! The seam between the capture core and a native graphics driver.

use std::collections::{BTreeMap, HashMap, HashSet};

use rcap_protocol::{Call, ContextId, LiveHandle, ResourceId, ResourceKind};
use tracing::{debug, trace};

use crate::error::{DriverError, Result};
use crate::identity::IdentityMap;

/// The live handles a call's logical ids resolve to in this instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveArgs {
    handles: BTreeMap<ResourceId, LiveHandle>,
}

impl LiveArgs {
    /// Resolve every id `call` refers to. Fails on the first id that was never
    /// registered in this instance.
    pub fn resolve(ids: &IdentityMap, call: &Call) -> Result<Self> {
        let handles = call
            .resource_ids()
            .into_iter()
            .map(|id| ids.resolve(id).map(|h| (id, h)))
            .collect::<Result<_>>()?;
        Ok(Self { handles })
    }

    pub fn get(&self, id: ResourceId) -> Option<LiveHandle> {
        self.handles.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceId, &LiveHandle)> {
        self.handles.iter()
    }
}

/// A native driver instance. Errors are passed through as they come; the core
/// never interprets them.
pub trait Driver {
    /// The native context every handle of this driver belongs to.
    fn context(&self) -> ContextId;

    /// Create a native resource and return its name.
    fn create(&mut self, kind: ResourceKind) -> Result<u64, DriverError>;

    fn destroy(&mut self, handle: LiveHandle) -> Result<(), DriverError>;

    /// Issue a call whose ids were already resolved into `args`.
    fn execute(&mut self, call: &Call, args: &LiveArgs) -> Result<(), DriverError>;

    /// Read back the current contents of a resource, when the driver can.
    fn fetch_contents(&mut self, _handle: LiveHandle) -> Option<Vec<u8>> {
        None
    }

    fn apply_contents(&mut self, handle: LiveHandle, data: &[u8]) -> Result<(), DriverError>;
}

/// In-memory driver. Hands out monotonic names, keeps a log of every executed
/// call and stores resource contents written through it.
pub struct NullDriver {
    context: ContextId,
    next_name: u64,
    live: HashSet<LiveHandle>,
    contents: HashMap<LiveHandle, Vec<u8>>,
    log: Vec<Call>,
    fail_next: Option<DriverError>,
}

impl NullDriver {
    pub fn new(context: ContextId) -> Self {
        Self::with_first_name(context, 1)
    }

    /// Driver whose first native name is `first`, so two instances can be made
    /// to hand out unrelated values.
    pub fn with_first_name(context: ContextId, first: u64) -> Self {
        Self {
            context,
            next_name: first.max(1),
            live: HashSet::new(),
            contents: HashMap::new(),
            log: Vec::new(),
            fail_next: None,
        }
    }

    /// Make the next `execute` fail with `err`.
    pub fn fail_next(&mut self, err: DriverError) {
        self.fail_next = Some(err);
    }

    pub fn log(&self) -> &[Call] {
        &self.log
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, handle: &LiveHandle) -> bool {
        self.live.contains(handle)
    }

    pub fn contents(&self, handle: &LiveHandle) -> Option<&[u8]> {
        self.contents.get(handle).map(Vec::as_slice)
    }

    fn check_live(&self, handle: &LiveHandle) -> Result<(), DriverError> {
        if self.live.contains(handle) {
            Ok(())
        } else {
            Err(DriverError::new(-1, format!("{} is not a live object", handle)))
        }
    }
}

impl Driver for NullDriver {
    fn context(&self) -> ContextId {
        self.context
    }

    fn create(&mut self, kind: ResourceKind) -> Result<u64, DriverError> {
        let name = self.next_name;
        self.next_name += 1;
        let handle = LiveHandle::new(self.context, kind, name);
        self.live.insert(handle);
        trace!("null driver created {}", handle);
        Ok(name)
    }

    fn destroy(&mut self, handle: LiveHandle) -> Result<(), DriverError> {
        if !self.live.remove(&handle) {
            return Err(DriverError::new(-1, format!("{} is not a live object", handle)));
        }
        self.contents.remove(&handle);
        trace!("null driver destroyed {}", handle);
        Ok(())
    }

    fn execute(&mut self, call: &Call, args: &LiveArgs) -> Result<(), DriverError> {
        if let Some(err) = self.fail_next.take() {
            debug!("null driver failing {:?}: {}", call.chunk_type(), err);
            return Err(err);
        }
        for (_, handle) in args.iter() {
            self.check_live(handle)?;
        }
        match call {
            Call::TextureSubImage { texture, data, .. } => {
                if let Some(handle) = args.get(*texture) {
                    self.contents.insert(handle, data.clone());
                }
            }
            Call::BufferData { buffer, data, .. } => {
                if let Some(handle) = args.get(*buffer) {
                    self.contents.insert(handle, data.clone());
                }
            }
            _ => {}
        }
        self.log.push(call.clone());
        Ok(())
    }

    fn fetch_contents(&mut self, handle: LiveHandle) -> Option<Vec<u8>> {
        self.contents.get(&handle).cloned()
    }

    fn apply_contents(&mut self, handle: LiveHandle, data: &[u8]) -> Result<(), DriverError> {
        self.check_live(&handle)?;
        self.contents.insert(handle, data.to_vec());
        Ok(())
    }
}
