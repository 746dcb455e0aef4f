//! Densely packed instance slots with handle indirection.
//!
//! Slots `[0, instance_count)` form the occupied prefix. Removing an instance
//! below the top leaves a hole; holes are reused smallest-first by later adds
//! and closed by [`InstanceTable::defragment`] before a build, which moves the
//! topmost instance into each remaining hole. Every slot touched since the last
//! build is covered by the dirty range so the build only re-uploads that span.

use std::collections::{BTreeSet, HashMap};
use std::ops::RangeInclusive;

use bytemuck::Pod;

use super::error::{Result, RtError};
use super::instance::RtInstance;

/// Opaque identity of a live instance. Never reused within one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceHandle(pub u64);

/// CPU side of the top-level instance table.
pub struct InstanceTable<T> {
    max_instances: u32,
    instances: Vec<RtInstance>,
    payloads: Vec<T>,
    slot_handles: Vec<Option<InstanceHandle>>,
    handle_slots: HashMap<InstanceHandle, u32>,
    holes: BTreeSet<u32>,
    next_instance_index: u32,
    next_id: u64,
    dirty: Option<(u32, u32)>,
}

impl<T: Pod> InstanceTable<T> {
    pub fn new(max_instances: u32) -> Self {
        let capacity = max_instances as usize;
        Self {
            max_instances,
            instances: vec![RtInstance::empty(); capacity],
            payloads: vec![T::zeroed(); capacity],
            slot_handles: vec![None; capacity],
            handle_slots: HashMap::with_capacity(capacity),
            holes: BTreeSet::new(),
            next_instance_index: 0,
            next_id: 0,
            dirty: None,
        }
    }

    pub fn max_instances(&self) -> u32 {
        self.max_instances
    }

    /// Length of the occupied prefix, holes included.
    pub fn instance_count(&self) -> u32 {
        self.next_instance_index
    }

    pub fn live_count(&self) -> usize {
        self.handle_slots.len()
    }

    pub fn hole_count(&self) -> usize {
        self.holes.len()
    }

    pub fn contains(&self, handle: InstanceHandle) -> bool {
        self.handle_slots.contains_key(&handle)
    }

    pub fn slot_of(&self, handle: InstanceHandle) -> Option<u32> {
        self.handle_slots.get(&handle).copied()
    }

    pub fn handle_at(&self, slot: u32) -> Option<InstanceHandle> {
        self.slot_handles.get(slot as usize).copied().flatten()
    }

    pub fn handles(&self) -> impl Iterator<Item = InstanceHandle> + '_ {
        self.handle_slots.keys().copied()
    }

    pub fn instances(&self) -> &[RtInstance] {
        &self.instances
    }

    pub fn payloads(&self) -> &[T] {
        &self.payloads
    }

    /// Inclusive slot range touched since the last [`Self::take_dirty_range`].
    pub fn dirty_range(&self) -> Option<RangeInclusive<u32>> {
        self.dirty.map(|(lo, hi)| lo..=hi)
    }

    /// Insert an instance, reusing the smallest hole first.
    ///
    /// Returns `None` when every slot is occupied.
    pub fn add(&mut self, instance: RtInstance, payload: T) -> Option<InstanceHandle> {
        let slot = match self.holes.pop_first() {
            Some(hole) => hole,
            None if self.next_instance_index >= self.max_instances => return None,
            None => {
                let top = self.next_instance_index;
                self.next_instance_index += 1;
                top
            }
        };

        let handle = InstanceHandle(self.next_id);
        self.next_id += 1;

        let i = slot as usize;
        self.instances[i] = instance;
        self.payloads[i] = payload;
        self.slot_handles[i] = Some(handle);
        self.handle_slots.insert(handle, slot);
        self.touch(slot);

        Some(handle)
    }

    pub fn remove(&mut self, handle: InstanceHandle) -> Result<()> {
        let slot = self
            .handle_slots
            .remove(&handle)
            .ok_or(RtError::UnknownInstance(handle))?;

        let i = slot as usize;
        self.instances[i] = RtInstance::empty();
        self.payloads[i] = T::zeroed();
        self.slot_handles[i] = None;
        self.touch(slot);

        if slot + 1 == self.next_instance_index {
            self.next_instance_index -= 1;
            self.absorb_trailing_holes();
        } else {
            self.holes.insert(slot);
        }

        Ok(())
    }

    /// Drop every instance. Handles already issued stay retired.
    pub fn clear(&mut self) {
        if self.next_instance_index > 0 {
            self.touch(0);
            self.touch(self.next_instance_index - 1);
        }
        for i in 0..self.next_instance_index as usize {
            self.instances[i] = RtInstance::empty();
            self.payloads[i] = T::zeroed();
            self.slot_handles[i] = None;
        }
        self.handle_slots.clear();
        self.holes.clear();
        self.next_instance_index = 0;
    }

    pub fn instance(&self, handle: InstanceHandle) -> Result<&RtInstance> {
        let slot = self.lookup(handle)?;
        Ok(&self.instances[slot as usize])
    }

    pub fn payload(&self, handle: InstanceHandle) -> Result<&T> {
        let slot = self.lookup(handle)?;
        Ok(&self.payloads[slot as usize])
    }

    /// Mutable access to the record; the slot becomes dirty.
    pub fn instance_mut(&mut self, handle: InstanceHandle) -> Result<&mut RtInstance> {
        let slot = self.access(handle)?;
        Ok(&mut self.instances[slot as usize])
    }

    /// Mutable access to the payload; the slot becomes dirty.
    pub fn payload_mut(&mut self, handle: InstanceHandle) -> Result<&mut T> {
        let slot = self.access(handle)?;
        Ok(&mut self.payloads[slot as usize])
    }

    pub fn set_transform(&mut self, handle: InstanceHandle, rows: [[f32; 4]; 3]) -> Result<()> {
        self.instance_mut(handle)?.transform = rows;
        Ok(())
    }

    pub fn set_payload(&mut self, handle: InstanceHandle, payload: T) -> Result<()> {
        *self.payload_mut(handle)? = payload;
        Ok(())
    }

    /// Mark the slot dirty without touching its contents.
    pub fn mark_changed(&mut self, handle: InstanceHandle) -> Result<()> {
        self.access(handle).map(|_| ())
    }

    /// Close every hole by moving the topmost instance into it.
    ///
    /// Runs in O(holes). Afterwards `[0, instance_count)` has no holes.
    pub fn defragment(&mut self) {
        let (Some(&first), Some(&last)) = (self.holes.first(), self.holes.last()) else {
            return;
        };
        self.touch(first);
        self.touch(last.max(self.next_instance_index - 1));

        while let Some(dst) = self.holes.pop_first() {
            // Trailing holes are always absorbed, so the top slot is live and above dst.
            let src = self.next_instance_index - 1;
            let (s, d) = (src as usize, dst as usize);

            self.instances[d] = self.instances[s];
            self.payloads[d] = self.payloads[s];
            self.slot_handles[d] = self.slot_handles[s];
            self.instances[s] = RtInstance::empty();
            self.payloads[s] = T::zeroed();
            self.slot_handles[s] = None;

            if let Some(handle) = self.slot_handles[d] {
                self.handle_slots.insert(handle, dst);
            }

            self.next_instance_index -= 1;
            self.absorb_trailing_holes();
        }
    }

    /// Return and reset the dirty range.
    pub fn take_dirty_range(&mut self) -> Option<RangeInclusive<u32>> {
        self.dirty.take().map(|(lo, hi)| lo..=hi)
    }

    fn lookup(&self, handle: InstanceHandle) -> Result<u32> {
        self.slot_of(handle).ok_or(RtError::UnknownInstance(handle))
    }

    fn access(&mut self, handle: InstanceHandle) -> Result<u32> {
        let slot = self.lookup(handle)?;
        self.touch(slot);
        Ok(slot)
    }

    fn touch(&mut self, slot: u32) {
        self.dirty = Some(match self.dirty {
            Some((lo, hi)) => (lo.min(slot), hi.max(slot)),
            None => (slot, slot),
        });
    }

    fn absorb_trailing_holes(&mut self) {
        while self.next_instance_index > 0 && self.holes.remove(&(self.next_instance_index - 1)) {
            self.next_instance_index -= 1;
        }
    }
}
