//! Slot arena and free-list front end
//!
//! Backing storage for collector-managed cells. Cells live in a growable
//! arena of uniform slots; reclaimed slots are recycled through the
//! collector's Free set before the arena grows, and growth is bounded by a
//! configurable cell limit. Exhausting that limit is the one failure this
//! subsystem surfaces as an ordinary error.

use crate::header::CellHeader;
use crate::GcError;

/// Callback invoked once, immediately before a cell's slot is recycled.
type Finalizer<T> = Box<dyn FnMut(&mut T)>;

/// One arena slot: collector bookkeeping plus the embedder's payload.
pub(crate) struct Slot<T> {
    pub header: CellHeader,
    pub finalizer: Option<Finalizer<T>>,
    pub payload: Option<T>,
}

/// Slot arena with allocation and free accounting.
pub(crate) struct Heap<T> {
    slots: Vec<Slot<T>>,
    /// Maximum number of slots (0 = unlimited).
    max_cells: usize,
    total_allocated: usize,
    total_freed: usize,
}

impl<T> Heap<T> {
    pub fn new() -> Heap<T> {
        Heap {
            slots: Vec::new(),
            max_cells: 0,
            total_allocated: 0,
            total_freed: 0,
        }
    }

    pub fn with_capacity(cells: usize) -> Heap<T> {
        let mut heap = Heap::new();
        heap.slots.reserve(cells);
        heap
    }

    pub fn set_max_cells(&mut self, cells: usize) {
        self.max_cells = cells;
    }

    /// Total slots in the arena, live and free.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn total_allocated(&self) -> usize {
        self.total_allocated
    }

    #[inline]
    pub fn total_freed(&self) -> usize {
        self.total_freed
    }

    #[inline]
    pub fn slot(&self, idx: u32) -> &Slot<T> {
        &self.slots[idx as usize]
    }

    #[inline]
    pub fn slot_mut(&mut self, idx: u32) -> &mut Slot<T> {
        &mut self.slots[idx as usize]
    }

    /// Payload of a slot that currently holds a cell.
    #[inline]
    pub fn payload(&self, idx: u32) -> &T {
        self.slots[idx as usize]
            .payload
            .as_ref()
            .expect("slot holds no cell")
    }

    #[inline]
    pub fn payload_mut(&mut self, idx: u32) -> &mut T {
        self.slots[idx as usize]
            .payload
            .as_mut()
            .expect("slot holds no cell")
    }

    /// Grow the arena by one empty slot.
    pub fn grow(&mut self) -> Result<u32, GcError> {
        if self.max_cells != 0 && self.slots.len() >= self.max_cells {
            return Err(GcError::OutOfMemory {
                limit: self.max_cells,
            });
        }
        let idx = self.slots.len() as u32;
        self.slots.push(Slot {
            header: CellHeader::default(),
            finalizer: None,
            payload: None,
        });
        Ok(idx)
    }

    /// Install a payload into a fresh or recycled slot and count the
    /// allocation. The slot must be empty.
    pub fn init_slot(&mut self, idx: u32, payload: T) {
        let slot = &mut self.slots[idx as usize];
        debug_assert!(slot.payload.is_none(), "allocating into an occupied slot");
        slot.header.reset();
        slot.finalizer = None;
        slot.payload = Some(payload);
        self.total_allocated += 1;
    }

    /// Advance the slot generation, turning outstanding handles stale.
    pub fn invalidate(&mut self, idx: u32) {
        let header = &mut self.slots[idx as usize].header;
        header.generation = header.generation.wrapping_add(1);
    }

    /// Run the finalizer, drop the payload, and count the free.
    pub fn clear_slot(&mut self, idx: u32) {
        let slot = &mut self.slots[idx as usize];
        let mut payload = slot.payload.take().expect("reclaiming an empty slot");
        if let Some(mut finalizer) = slot.finalizer.take() {
            finalizer(&mut payload);
        }
        self.total_freed += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_grow_and_init() {
        let mut heap: Heap<i32> = Heap::new();
        let idx = heap.grow().unwrap();
        heap.init_slot(idx, 7);

        assert_eq!(*heap.payload(idx), 7);
        assert_eq!(heap.capacity(), 1);
        assert_eq!(heap.total_allocated(), 1);
        assert_eq!(heap.total_freed(), 0);
    }

    #[test]
    fn test_cell_limit() {
        let mut heap: Heap<i32> = Heap::new();
        heap.set_max_cells(1);
        heap.grow().unwrap();

        assert!(matches!(
            heap.grow(),
            Err(GcError::OutOfMemory { limit: 1 })
        ));
        assert_eq!(heap.capacity(), 1);
    }

    #[test]
    fn test_clear_runs_finalizer_and_bumps_generation() {
        let fired = Rc::new(Cell::new(0));
        let mut heap: Heap<i32> = Heap::new();
        let idx = heap.grow().unwrap();
        heap.init_slot(idx, 1);

        let counter = Rc::clone(&fired);
        heap.slot_mut(idx).finalizer = Some(Box::new(move |_| counter.set(counter.get() + 1)));

        let generation = heap.slot(idx).header.generation;
        heap.invalidate(idx);
        heap.clear_slot(idx);

        assert_eq!(fired.get(), 1);
        assert_eq!(heap.slot(idx).header.generation, generation + 1);
        assert_eq!(heap.total_freed(), 1);

        // the slot is reusable, and reuse does not rerun the finalizer
        heap.init_slot(idx, 2);
        assert_eq!(*heap.payload(idx), 2);
        assert_eq!(heap.total_allocated(), 2);
        assert_eq!(fired.get(), 1);
    }
}
