//! Dirty/invalidation tracking on top of the record graph.
//!
//! A dirty record has content that changed since it was last serialized. Dirtiness
//! flows from a resource to everything depending on it: writing a texture dirties
//! every framebuffer it is attached to. The next snapshot re-serializes dirty
//! records in full and reuses the cached block of every clean one.

use std::collections::VecDeque;

use rcap_protocol::ResourceId;
use tracing::debug;

use crate::error::Result;
use crate::record::RecordGraph;

impl RecordGraph {
    /// Mark `id` and every record transitively depending on it dirty.
    /// Records that are already dirty are not walked again. Returns the ids that
    /// changed state.
    pub fn mark_dirty(&mut self, id: ResourceId) -> Vec<ResourceId> {
        let mut marked = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(next) = queue.pop_front() {
            let Some(record) = self.records.get_mut(&next) else {
                continue;
            };
            if record.dirty {
                continue;
            }
            record.dirty = true;
            marked.push(next);
            queue.extend(record.children.iter().copied());
        }
        if !marked.is_empty() {
            debug!("{} dirtied {} record(s)", id, marked.len());
        }
        marked
    }

    /// Explicit attachment invalidation on a framebuffer: only its direct parents
    /// are marked, each of which then propagates as usual.
    pub fn mark_parents_dirty(&mut self, id: ResourceId) -> Vec<ResourceId> {
        let parents: Vec<ResourceId> = match self.records.get(&id) {
            Some(record) => record.parents.iter().copied().collect(),
            None => return Vec::new(),
        };
        parents
            .into_iter()
            .flat_map(|parent| self.mark_dirty(parent))
            .collect()
    }

    /// Point `child` at a different parent. The edge to `previous` is dropped (the
    /// caller passes `None` when another slot still uses it), the edge to `next` is
    /// added and `next` is dirtied.
    pub fn rebind(
        &mut self,
        child: ResourceId,
        previous: Option<ResourceId>,
        next: ResourceId,
    ) -> Result<()> {
        if let Some(prev) = previous.filter(|p| !p.is_null() && *p != next) {
            self.remove_parent(child, prev)?;
        }
        if !next.is_null() && self.contains(next) {
            self.add_parent(child, next)?;
            self.mark_dirty(next);
        }
        Ok(())
    }

    pub fn is_dirty(&self, id: ResourceId) -> bool {
        self.records.get(&id).is_some_and(|r| r.dirty)
    }

    pub fn dirty_records(&self) -> Vec<ResourceId> {
        self.records
            .values()
            .filter(|r| r.dirty)
            .map(|r| r.id())
            .collect()
    }

    pub(crate) fn clear_dirty(&mut self, id: ResourceId) {
        if let Some(record) = self.records.get_mut(&id) {
            record.dirty = false;
        }
    }
}
