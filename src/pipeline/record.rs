//! Per-mesh records and their build slots.
//!
//! A [`MeshSet`] is fixed once collected: the records are an immutable shared
//! slice, and the only state that changes afterwards lives in one
//! [`BuildSlot`] per record. The build worker writes a slot when it has
//! requested that mesh's BLAS; the frame loop only reads. No lock is taken on
//! either side.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use crate::engine::{AccelerationEngine, BlasHandle};
use crate::gpu::PackedLayout;
use crate::scene::Renderable;

/// One renderable mesh and its range in the vertex arena.
pub struct MeshRecord {
    pub name: String,
    pub source: Arc<dyn Renderable>,
    pub layout: PackedLayout,
    /// First triangle in the arena (positions start at `3 * tri_offset`).
    pub tri_offset: usize,
    pub tri_count: usize,
}

impl fmt::Debug for MeshRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshRecord")
            .field("name", &self.name)
            .field("tri_offset", &self.tri_offset)
            .field("tri_count", &self.tri_count)
            .finish()
    }
}

/// Build progress of one mesh.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum BuildState {
    /// No build requested yet.
    Pending = 0,
    /// The engine accepted the build and issued a handle.
    Requested = 1,
    /// The engine refused the build; the mesh never becomes ready.
    Failed = 2,
}

const NO_HANDLE: u32 = u32::MAX;

/// Lock-free per-mesh build state.
#[derive(Debug)]
pub struct BuildSlot {
    handle: AtomicU32,
    state: AtomicU8,
}

impl Default for BuildSlot {
    fn default() -> Self {
        Self {
            handle: AtomicU32::new(NO_HANDLE),
            state: AtomicU8::new(BuildState::Pending as u8),
        }
    }
}

impl BuildSlot {
    pub fn state(&self) -> BuildState {
        match self.state.load(Ordering::Acquire) {
            1 => BuildState::Requested,
            2 => BuildState::Failed,
            _ => BuildState::Pending,
        }
    }

    /// Handle of the requested BLAS, if any.
    pub fn handle(&self) -> Option<BlasHandle> {
        if self.state() != BuildState::Requested {
            return None;
        }
        match self.handle.load(Ordering::Acquire) {
            NO_HANDLE => None,
            h => Some(BlasHandle(h)),
        }
    }

    pub(crate) fn mark_requested(&self, handle: BlasHandle) {
        self.handle.store(handle.0, Ordering::Release);
        self.state.store(BuildState::Requested as u8, Ordering::Release);
    }

    pub(crate) fn mark_failed(&self) {
        self.state.store(BuildState::Failed as u8, Ordering::Release);
    }

    /// Remove and return the handle so it is released exactly once.
    pub(crate) fn take_handle(&self) -> Option<BlasHandle> {
        match self.handle.swap(NO_HANDLE, Ordering::AcqRel) {
            NO_HANDLE => None,
            h => Some(BlasHandle(h)),
        }
    }

    /// True if the BLAS was requested and the engine reports it built.
    pub fn is_ready(&self, engine: &dyn AccelerationEngine) -> bool {
        self.handle().is_some_and(|h| engine.is_ready(h))
    }
}

/// Immutable snapshot of one processing pass's meshes plus their build slots.
///
/// Cloning shares both; the build worker gets a clone.
#[derive(Clone, Debug)]
pub struct MeshSet {
    records: Arc<[MeshRecord]>,
    slots: Arc<[BuildSlot]>,
    total_triangles: usize,
}

impl MeshSet {
    pub fn new(records: Vec<MeshRecord>) -> Self {
        let total_triangles = records.iter().map(|r| r.tri_count).sum();
        let slots = records.iter().map(|_| BuildSlot::default()).collect();
        Self {
            records: records.into(),
            slots,
            total_triangles,
        }
    }

    pub fn records(&self) -> &[MeshRecord] {
        &self.records
    }

    pub fn slots(&self) -> &[BuildSlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_triangles(&self) -> usize {
        self.total_triangles
    }

    /// Records paired with their slots, in enumeration order.
    pub fn iter(&self) -> impl Iterator<Item = (&MeshRecord, &BuildSlot)> {
        self.records.iter().zip(self.slots.iter())
    }

    /// Names of meshes whose BLAS is not ready.
    pub fn not_ready(&self, engine: &dyn AccelerationEngine) -> Vec<&str> {
        self.iter()
            .filter(|(_, slot)| !slot.is_ready(engine))
            .map(|(record, _)| record.name.as_str())
            .collect()
    }

    /// True if every mesh has a ready BLAS. False for an empty set.
    pub fn all_ready(&self, engine: &dyn AccelerationEngine) -> bool {
        !self.is_empty() && self.slots.iter().all(|s| s.is_ready(engine))
    }

    /// Release every BLAS this set still holds.
    pub fn destroy_blas(&self, engine: &dyn AccelerationEngine) -> usize {
        let mut destroyed = 0;
        for slot in self.slots.iter() {
            if let Some(h) = slot.take_handle() {
                engine.destroy_blas(h);
                destroyed += 1;
            }
        }
        destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_transitions() {
        let slot = BuildSlot::default();
        assert_eq!(slot.state(), BuildState::Pending);
        assert_eq!(slot.handle(), None);

        slot.mark_requested(BlasHandle(4));
        assert_eq!(slot.state(), BuildState::Requested);
        assert_eq!(slot.handle(), Some(BlasHandle(4)));

        assert_eq!(slot.take_handle(), Some(BlasHandle(4)));
        assert_eq!(slot.take_handle(), None);
        assert_eq!(slot.handle(), None);
    }

    #[test]
    fn test_failed_slot_has_no_handle() {
        let slot = BuildSlot::default();
        slot.mark_failed();
        assert_eq!(slot.state(), BuildState::Failed);
        assert_eq!(slot.handle(), None);
    }
}
