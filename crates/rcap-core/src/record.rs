//! Resource record graph.
//!
//! Records live in an arena keyed by [`ResourceId`]; dependency edges are stored as
//! id sets in both directions, never as references. A parent edge `child -> parent`
//! means the child's state can only be reconstructed once the parent exists (a
//! framebuffer is a child of the textures attached to it). Cycles are rejected when
//! an edge is inserted.

use std::collections::{BTreeMap, BTreeSet};

use rcap_protocol::{Chunk, ResourceId, ResourceKind};
use tracing::{debug, trace};

use crate::error::{CaptureError, Result};

pub struct ResourceRecord {
    id: ResourceId,
    kind: ResourceKind,
    chunks: Vec<Chunk>,
    pub(crate) parents: BTreeSet<ResourceId>,
    pub(crate) children: BTreeSet<ResourceId>,
    pub(crate) dirty: bool,
    /// The application deleted the resource but a child still depends on it.
    retired: bool,
    /// Serialized block from the last snapshot; dropped on any change.
    pub(crate) cached_block: Option<Vec<u8>>,
}

impl ResourceRecord {
    fn new(id: ResourceId, kind: ResourceKind) -> Self {
        Self {
            id,
            kind,
            chunks: Vec::new(),
            parents: BTreeSet::new(),
            children: BTreeSet::new(),
            dirty: false,
            retired: false,
            cached_block: None,
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn last_chunk(&self) -> Option<&Chunk> {
        self.chunks.last()
    }

    pub fn parents(&self) -> &BTreeSet<ResourceId> {
        &self.parents
    }

    pub fn children(&self) -> &BTreeSet<ResourceId> {
        &self.children
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

#[derive(Default)]
pub struct RecordGraph {
    pub(crate) records: BTreeMap<ResourceId, ResourceRecord>,
}

impl RecordGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the record for a newly registered resource. A second call for the
    /// same id keeps the existing record.
    pub fn add_record(&mut self, id: ResourceId, kind: ResourceKind) -> &mut ResourceRecord {
        self.records.entry(id).or_insert_with(|| {
            debug!("added {:?} record {}", kind, id);
            ResourceRecord::new(id, kind)
        })
    }

    pub fn get(&self, id: ResourceId) -> Option<&ResourceRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.records.values()
    }

    pub(crate) fn get_mut(&mut self, id: ResourceId) -> Result<&mut ResourceRecord> {
        self.records
            .get_mut(&id)
            .ok_or(CaptureError::RecordNotFound(id))
    }

    /// Append a chunk. The record owns it from here on.
    pub fn add_chunk(&mut self, id: ResourceId, chunk: Chunk) -> Result<()> {
        let record = self.get_mut(id)?;
        trace!("{} += {:#06x}", id, chunk.opcode());
        record.chunks.push(chunk);
        record.cached_block = None;
        Ok(())
    }

    /// Append a chunk, replacing the previous one instead when both have the same
    /// opcode and that chunk type is a pure overwrite of the same state.
    /// Returns whether a chunk was replaced.
    pub fn coalesce_chunk(&mut self, id: ResourceId, chunk: Chunk) -> Result<bool> {
        let record = self.get_mut(id)?;
        let replaceable = chunk.chunk_type().is_some_and(|ty| ty.coalesces())
            && record
                .chunks
                .last()
                .is_some_and(|last| last.opcode() == chunk.opcode());
        record.cached_block = None;
        if replaceable {
            trace!("{} replaces last {:#06x}", id, chunk.opcode());
            if let Some(last) = record.chunks.last_mut() {
                *last = chunk;
            }
            Ok(true)
        } else {
            record.chunks.push(chunk);
            Ok(false)
        }
    }

    /// Record that `child` depends on `parent`.
    pub fn add_parent(&mut self, child: ResourceId, parent: ResourceId) -> Result<()> {
        if !self.records.contains_key(&parent) {
            return Err(CaptureError::RecordNotFound(parent));
        }
        if !self.records.contains_key(&child) {
            return Err(CaptureError::RecordNotFound(child));
        }
        if child == parent || self.depends_on(parent, child) {
            return Err(CaptureError::CyclicDependency { child, parent });
        }

        let record = self.get_mut(child)?;
        if !record.parents.insert(parent) {
            return Ok(());
        }
        record.cached_block = None;
        let parent_dirty = {
            let p = self.get_mut(parent)?;
            p.children.insert(child);
            p.dirty
        };
        debug!("{} now depends on {}", child, parent);
        // Every dependent of a dirty record is dirty too.
        if parent_dirty {
            self.mark_dirty(child);
        }
        Ok(())
    }

    /// Drop the edge `child -> parent`. A retired parent that loses its last child
    /// is removed.
    pub fn remove_parent(&mut self, child: ResourceId, parent: ResourceId) -> Result<()> {
        let record = self.get_mut(child)?;
        if !record.parents.remove(&parent) {
            return Ok(());
        }
        record.cached_block = None;
        if let Some(p) = self.records.get_mut(&parent) {
            p.children.remove(&child);
        }
        debug!("{} no longer depends on {}", child, parent);
        self.collect_retired(parent);
        Ok(())
    }

    /// Whether `from` reaches `to` by following parent edges.
    pub fn depends_on(&self, from: ResourceId, to: ResourceId) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(record) = self.records.get(&id) {
                stack.extend(record.parents.iter().copied());
            }
        }
        false
    }

    /// Destroy a record. Only valid once no other record depends on it.
    pub fn delete(&mut self, id: ResourceId) -> Result<()> {
        let record = self
            .records
            .get(&id)
            .ok_or(CaptureError::RecordNotFound(id))?;
        if !record.children.is_empty() {
            return Err(CaptureError::StillReferenced {
                id,
                children: record.children.len(),
            });
        }

        let parents: Vec<ResourceId> = record.parents.iter().copied().collect();
        self.records.remove(&id);
        debug!("deleted record {}", id);

        for parent in parents {
            if let Some(p) = self.records.get_mut(&parent) {
                p.children.remove(&id);
            }
            self.collect_retired(parent);
        }
        Ok(())
    }

    /// The application destroyed the resource. The record goes away now if nothing
    /// depends on it, otherwise once its last dependent lets go.
    pub fn retire(&mut self, id: ResourceId) -> Result<()> {
        let record = self.get_mut(id)?;
        record.retired = true;
        if record.children.is_empty() {
            self.delete(id)
        } else {
            debug!(
                "record {} retired, kept alive by {} dependent(s)",
                id,
                record.children.len()
            );
            Ok(())
        }
    }

    fn collect_retired(&mut self, id: ResourceId) {
        let unreferenced = self
            .records
            .get(&id)
            .is_some_and(|r| r.retired && r.children.is_empty());
        if unreferenced {
            // Cannot fail: the record exists and has no children.
            let _ = self.delete(id);
        }
    }

    /// All records ordered so every parent comes before its children. Ties are
    /// broken by ascending id, so the order is deterministic.
    pub fn topological_order(&self) -> Vec<ResourceId> {
        let mut pending: BTreeMap<ResourceId, usize> = self
            .records
            .iter()
            .map(|(id, r)| (*id, r.parents.len()))
            .collect();
        let mut ready: BTreeSet<ResourceId> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.records.len());

        while let Some(id) = ready.pop_first() {
            order.push(id);
            pending.remove(&id);
            for child in &self.records[&id].children {
                if let Some(n) = pending.get_mut(child) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(*child);
                    }
                }
            }
        }
        order
    }

    /// Every `(child, parent)` edge in the graph.
    pub fn edges(&self) -> BTreeSet<(ResourceId, ResourceId)> {
        self.records
            .values()
            .flat_map(|r| r.parents.iter().map(move |p| (r.id, *p)))
            .collect()
    }
}
