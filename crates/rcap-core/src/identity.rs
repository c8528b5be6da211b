use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rcap_protocol::{IdAllocator, LiveHandle, ResourceId};
use tracing::{debug, trace};

use crate::error::{CaptureError, Result};

/// Bidirectional mapping between logical resource ids and the live native handles
/// of this process instance.
///
/// On the capture side, `register` mints ids for handles the application creates.
/// On the replay side, `bind_live` attaches freshly created handles to the ids read
/// from the stream, whatever native values the two runs happened to get.
///
/// One map may be shared by every context of a share group, so all access goes
/// through a lock.
pub struct IdentityMap {
    ids: Arc<IdAllocator>,
    inner: RwLock<Maps>,
}

#[derive(Default)]
struct Maps {
    /// LiveHandle -> ResourceId
    by_handle: HashMap<LiveHandle, ResourceId>,
    /// ResourceId -> LiveHandle
    by_id: HashMap<ResourceId, LiveHandle>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(IdAllocator::new()))
    }

    /// Map that mints ids from an allocator shared with other maps.
    pub fn with_allocator(ids: Arc<IdAllocator>) -> Self {
        Self {
            ids,
            inner: RwLock::new(Maps::default()),
        }
    }

    /// Register a native handle and return its logical id.
    /// Registering the same handle again returns the id it already has.
    pub fn register(&self, handle: LiveHandle) -> ResourceId {
        let mut maps = self.inner.write();
        if let Some(id) = maps.by_handle.get(&handle) {
            trace!("{} already registered as {}", handle, id);
            return *id;
        }
        let id = self.ids.alloc();
        maps.by_handle.insert(handle, id);
        maps.by_id.insert(id, handle);
        debug!("registered {} as {}", handle, id);
        id
    }

    /// Bind a live handle to an id that was minted elsewhere (read from a stream).
    pub fn bind_live(&self, id: ResourceId, handle: LiveHandle) -> Result<()> {
        let mut maps = self.inner.write();
        if let Some(existing) = maps.by_handle.get(&handle) {
            if *existing == id {
                return Ok(());
            }
            return Err(CaptureError::DuplicateRegistration {
                handle,
                existing: *existing,
                requested: id,
            });
        }
        if let Some(bound) = maps.by_id.get(&id) {
            return Err(CaptureError::DuplicateRegistration {
                handle: *bound,
                existing: id,
                requested: id,
            });
        }
        self.ids.reserve_through(id);
        maps.by_handle.insert(handle, id);
        maps.by_id.insert(id, handle);
        debug!("bound {} to {}", id, handle);
        Ok(())
    }

    /// Remove the mapping for `id`, returning the handle it pointed at.
    pub fn unregister(&self, id: ResourceId) -> Option<LiveHandle> {
        let mut maps = self.inner.write();
        let handle = maps.by_id.remove(&id)?;
        maps.by_handle.remove(&handle);
        debug!("unregistered {} ({})", id, handle);
        Some(handle)
    }

    /// Resolve a logical id to the live handle of this instance.
    pub fn resolve(&self, id: ResourceId) -> Result<LiveHandle> {
        self.inner
            .read()
            .by_id
            .get(&id)
            .copied()
            .ok_or(CaptureError::ResourceNotFound(id))
    }

    /// Look up the logical id of a native handle.
    pub fn lookup_id(&self, handle: &LiveHandle) -> Option<ResourceId> {
        self.inner.read().by_handle.get(handle).copied()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.inner.read().by_id.contains_key(&id)
    }

    /// Return number of registered resources.
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }
}

impl Default for IdentityMap {
    fn default() -> Self {
        Self::new()
    }
}
