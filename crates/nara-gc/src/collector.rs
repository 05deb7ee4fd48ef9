//! Incremental cycle-collecting garbage collector
//!
//! This module implements the collector proper: immediate reference
//! counting reclaims acyclic garbage as soon as its last reference is
//! dropped, and a lazy tracing pass over the interest sets reclaims
//! reference cycles. One call to [`Collector::step`] performs one bounded
//! unit of work, chosen by fixed priority:
//!
//! 1. report stability if two epochs completed without mutator activity
//! 2. drain one free-pending cell (cascade releases, finalize, recycle)
//! 3. trace one boundary cell and confirm it reachable
//! 4. trace one pending root
//! 5. sweep one unprocessed cell (it was not proven reachable this epoch)
//! 6. reset the epoch, flipping the root and survivor set roles
//!
//! The ordering guarantees that nothing is swept until every cell reachable
//! from the currently known roots has been promoted out of the unprocessed
//! set, and that refcount-zero cascades complete ahead of new tracing work.

use crate::header::{CellState, Handle};
use crate::heap::Heap;
use crate::list::{SetId, SetLists};
use crate::trace::{Trace, Visitor};
use crate::GcResult;
use std::fmt;

/// Consecutive quiet epochs after which the collector reports the heap
/// stable without scanning.
const QUIET_EPOCHS_STABLE: u32 = 2;

/// Collector statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Cells handed out over the collector's lifetime.
    pub total_allocated: usize,

    /// Cells reclaimed over the collector's lifetime.
    pub total_freed: usize,

    /// Collector steps performed.
    pub steps: usize,

    /// Completed epochs (color flips).
    pub epochs: usize,
}

/// Arena occupancy statistics.
#[derive(Debug, Clone, Copy)]
pub struct HeapStats {
    /// Cells currently live.
    pub live_cells: usize,

    /// Reclaimed slots available for reuse.
    pub free_slots: usize,

    /// Total slots in the arena.
    pub capacity: usize,
}

/// Incremental cycle-collecting garbage collector.
///
/// The collector owns the slot arena and the interest sets and is driven
/// cooperatively: the mutator reports reference stores and drops
/// ([`advise_new_link`](Collector::advise_new_link) /
/// [`advise_stale_link`](Collector::advise_stale_link)), pins cells with
/// [`lock`](Collector::lock) / [`unlock`](Collector::unlock), and
/// interleaves [`step`](Collector::step) calls with its own progress.
///
/// Every entry point takes `&mut self`, and embedder callbacks (the
/// [`Trace`] impl, finalizers) only ever receive payload borrows, so
/// re-entering the collector from inside a callback does not type-check.
pub struct Collector<T> {
    heap: Heap<T>,
    sets: SetLists,

    /// Which survivor set currently plays the unprocessed role.
    unprocessed: SetId,

    /// Which root set currently holds roots not yet traced this epoch.
    pending_roots: SetId,

    /// Epochs completed since the last mutator-driven reset.
    quiet_epochs: u32,

    steps: usize,
    epochs: usize,

    /// Scratch buffer reused across link enumerations.
    scratch: Vec<Handle>,
}

impl<T: Trace> Collector<T> {
    /// Create an empty collector.
    pub fn new() -> Collector<T> {
        Collector {
            heap: Heap::new(),
            sets: SetLists::new(),
            unprocessed: SetId::SurvivorA,
            pending_roots: SetId::RootA,
            quiet_epochs: 0,
            steps: 0,
            epochs: 0,
            scratch: Vec::new(),
        }
    }

    /// Create a collector with arena space reserved for `cells` cells.
    pub fn with_capacity(cells: usize) -> Collector<T> {
        let mut collector = Collector::new();
        collector.heap = Heap::with_capacity(cells);
        collector
    }

    /// Bound the arena to `cells` cells (0 = unlimited). Allocation past
    /// the bound fails with [`GcError::OutOfMemory`](crate::GcError); no
    /// collection is triggered on the caller's behalf.
    pub fn set_max_cells(&mut self, cells: usize) {
        self.heap.set_max_cells(cells);
    }

    // ---- allocation ----------------------------------------------------

    /// Allocate a cell holding `payload`.
    ///
    /// Recycles a reclaimed slot when one is available, growing the arena
    /// otherwise. The new cell starts unprocessed with refcount 0 and
    /// unlocked; the payload is installed before the handle is returned.
    pub fn alloc(&mut self, payload: T) -> GcResult<Handle> {
        let idx = match self.sets.pop_front(SetId::Free) {
            Some(idx) => idx,
            None => {
                let idx = self.heap.grow()?;
                let node = self.sets.grow();
                debug_assert_eq!(node, idx);
                idx
            }
        };
        self.heap.init_slot(idx, payload);
        self.sets.push_back(idx, self.unprocessed);
        self.quiet_epochs = 0;
        Ok(Handle::new(idx, self.heap.slot(idx).header.generation))
    }

    /// Register a finalizer for `h`, replacing any previous one.
    ///
    /// The finalizer runs exactly once, immediately before the cell's slot
    /// is recycled. Finalizers are not run for cells still live when the
    /// collector itself is dropped.
    pub fn set_finalizer(&mut self, h: Handle, finalizer: impl FnMut(&mut T) + 'static) {
        let idx = self.expect_live(h, "set_finalizer");
        self.heap.slot_mut(idx).finalizer = Some(Box::new(finalizer));
    }

    // ---- payload access ------------------------------------------------

    /// Borrow the payload of a live cell.
    ///
    /// # Panics
    ///
    /// Panics if `h` is stale; holding a handle across reclamation and
    /// dereferencing it is a contract violation.
    pub fn get(&self, h: Handle) -> &T {
        let idx = self.expect_live(h, "get");
        self.heap.payload(idx)
    }

    /// Mutably borrow the payload of a live cell.
    ///
    /// # Panics
    ///
    /// Panics if `h` is stale.
    pub fn get_mut(&mut self, h: Handle) -> &mut T {
        let idx = self.expect_live(h, "get_mut");
        self.heap.payload_mut(idx)
    }

    // ---- root locking --------------------------------------------------

    /// Pin `h` as a GC root (a stack slot, a global handle). Idempotent.
    pub fn lock(&mut self, h: Handle) {
        let idx = self.expect_live(h, "lock");
        self.quiet_epochs = 0;
        self.heap.slot_mut(idx).header.locked = true;
        let owner = self.sets.owner(idx).expect("live cell outside any set");
        if !matches!(owner, SetId::RootA | SetId::RootB) {
            self.sets.move_to(idx, self.pending_roots);
        }
    }

    /// Release a pinned root.
    ///
    /// The cell stays alive while other cells still reference it; with no
    /// stored references left it is queued for reclamation.
    ///
    /// # Panics
    ///
    /// Panics if `h` is not currently a root.
    pub fn unlock(&mut self, h: Handle) {
        let idx = self.expect_live(h, "unlock");
        let owner = self.sets.owner(idx).expect("live cell outside any set");
        assert!(
            matches!(owner, SetId::RootA | SetId::RootB),
            "unlock of cell {h} which is not a root"
        );
        let header = &mut self.heap.slot_mut(idx).header;
        header.locked = false;
        let dest = if header.refcount > 0 {
            SetId::Boundary
        } else {
            SetId::FreePending
        };
        self.sets.move_to(idx, dest);
        self.quiet_epochs = 0;
    }

    // ---- reference counting --------------------------------------------

    /// Note that the mutator stored a reference to `h`.
    ///
    /// Must be called once per handle written into a reachable structure.
    /// A newly referenced unprocessed cell is promoted to the boundary so
    /// it cannot be swept as garbage this epoch.
    ///
    /// # Panics
    ///
    /// Panics if `h` is stale or the cell is queued for reclamation;
    /// storing a reference to such a cell is a contract violation.
    pub fn advise_new_link(&mut self, h: Handle) {
        let idx = self.expect_live(h, "advise_new_link");
        let owner = self.sets.owner(idx).expect("live cell outside any set");
        assert!(
            !matches!(owner, SetId::Free | SetId::FreePending),
            "advise_new_link on cell {h} awaiting reclamation"
        );
        self.heap.slot_mut(idx).header.refcount += 1;
        if owner == self.unprocessed {
            self.sets.move_to(idx, SetId::Boundary);
        }
    }

    /// Note that the mutator dropped or overwrote a stored reference to
    /// `h`.
    ///
    /// Defined as a no-op on stale handles and on cells whose refcount is
    /// already zero: reclaiming a reference cycle tears down cells that
    /// still hold references to each other, and the releases issued along
    /// the way must tolerate targets that went first.
    pub fn advise_stale_link(&mut self, h: Handle) {
        self.release(h);
    }

    fn release(&mut self, h: Handle) {
        let Some(idx) = self.live_index(h) else {
            return;
        };
        let header = &mut self.heap.slot_mut(idx).header;
        if header.refcount == 0 {
            return;
        }
        header.refcount -= 1;
        if header.refcount > 0 {
            return;
        }
        let locked = header.locked;
        self.quiet_epochs = 0;
        if !locked {
            self.sets.move_to(idx, SetId::FreePending);
        }
    }

    // ---- queries -------------------------------------------------------

    /// True while `h` names a live (not reclaimed) cell.
    #[inline]
    pub fn is_live(&self, h: Handle) -> bool {
        self.live_index(h).is_some()
    }

    /// True while the cell is held in one of the root sets.
    pub fn is_root(&self, h: Handle) -> bool {
        self.live_index(h).is_some_and(|idx| {
            matches!(self.sets.owner(idx), Some(SetId::RootA | SetId::RootB))
        })
    }

    /// True while the mutator holds the cell locked.
    pub fn is_locked(&self, h: Handle) -> bool {
        self.live_index(h)
            .is_some_and(|idx| self.heap.slot(idx).header.locked)
    }

    /// Stored-reference count of a live cell; 0 for stale handles.
    pub fn refcount(&self, h: Handle) -> u32 {
        self.live_index(h)
            .map_or(0, |idx| self.heap.slot(idx).header.refcount)
    }

    /// Lifecycle stage of the cell `h` names. Stale handles report
    /// [`CellState::Free`].
    pub fn state_of(&self, h: Handle) -> CellState {
        match self.live_index(h) {
            None => CellState::Free,
            Some(idx) => self.state_of_index(idx),
        }
    }

    fn state_of_index(&self, idx: u32) -> CellState {
        let owner = self.sets.owner(idx).expect("live cell outside any set");
        match owner {
            SetId::Free => CellState::Free,
            SetId::Boundary => CellState::Boundary,
            SetId::FreePending => CellState::FreePending,
            SetId::RootA | SetId::RootB => {
                if owner == self.pending_roots {
                    CellState::RootUnprocessed
                } else {
                    CellState::RootProcessed
                }
            }
            SetId::SurvivorA | SetId::SurvivorB => {
                if owner == self.unprocessed {
                    CellState::Unprocessed
                } else {
                    CellState::Reachable
                }
            }
        }
    }

    // ---- collection ----------------------------------------------------

    /// Perform one bounded unit of collection work.
    ///
    /// Returns `true` once the heap is stable: two consecutive epochs
    /// completed with no allocation, lock activity, or refcount reaching
    /// zero. A stable collector stays stable (and does no work) until the
    /// mutator runs again; epoch resets alone return `false` and are
    /// observable through [`stats`](Collector::stats).
    pub fn step(&mut self) -> bool {
        self.steps += 1;

        if self.quiet_epochs >= QUIET_EPOCHS_STABLE {
            return true;
        }
        if let Some(idx) = self.sets.pop_front(SetId::FreePending) {
            self.reclaim(idx);
            return false;
        }
        if let Some(idx) = self.sets.front(SetId::Boundary) {
            self.trace_links(idx);
            self.sets.move_to(idx, self.reachable_set());
            return false;
        }
        if let Some(idx) = self.sets.front(self.pending_roots) {
            self.trace_links(idx);
            self.sets.move_to(idx, self.processed_roots());
            return false;
        }
        if let Some(idx) = self.sets.pop_front(self.unprocessed) {
            self.reclaim(idx);
            return false;
        }
        self.reset_epoch();
        false
    }

    /// Run collection steps until the collector reports the heap stable.
    ///
    /// This is the only looping primitive: each step is bounded, and the
    /// loop ends once two epochs pass without mutator activity, by which
    /// point every cell unreachable from the locked roots has been
    /// reclaimed.
    pub fn run_to_quiescence(&mut self) {
        while !self.step() {}
    }

    /// Release the outgoing links of a detached cell, finalize it, and
    /// recycle its slot.
    ///
    /// The generation advances before the cascade so that self-links and
    /// intra-cycle links resolve to a stale handle and drop out as no-ops.
    fn reclaim(&mut self, idx: u32) {
        debug_assert!(self.sets.owner(idx).is_none());
        self.heap.invalidate(idx);

        let mut links = std::mem::take(&mut self.scratch);
        links.clear();
        self.heap.payload(idx).trace(&mut Visitor::new(&mut links));
        for &target in &links {
            self.release(target);
        }
        self.scratch = links;

        self.heap.clear_slot(idx);
        self.sets.push_back(idx, SetId::Free);

        #[cfg(feature = "tracing")]
        tracing::debug!(cell = idx, "reclaim");
    }

    /// Trace the outgoing links of `idx`: referents still unprocessed move
    /// to the boundary, as does any root that lost its lock.
    ///
    /// # Panics
    ///
    /// Panics if a link resolves to a reclaimed cell; a reachable cell
    /// holding a stale handle means the embedder dropped a reference
    /// without reporting it.
    fn trace_links(&mut self, idx: u32) {
        let mut links = std::mem::take(&mut self.scratch);
        links.clear();
        self.heap.payload(idx).trace(&mut Visitor::new(&mut links));
        for &target in &links {
            let referent = self.expect_live(target, "trace");
            let owner = self.sets.owner(referent).expect("live cell outside any set");
            if owner == self.unprocessed {
                self.sets.move_to(referent, SetId::Boundary);
            } else if matches!(owner, SetId::RootA | SetId::RootB)
                && !self.heap.slot(referent).header.locked
            {
                self.sets.move_to(referent, SetId::Boundary);
            }
        }
        self.scratch = links;
    }

    /// End of epoch: swap the root-set roles (the sentinel rotation) and
    /// the survivor-set colors, so last epoch's survivors become this
    /// epoch's sweep candidates.
    fn reset_epoch(&mut self) {
        debug_assert!(self.sets.is_empty(SetId::FreePending));
        debug_assert!(self.sets.is_empty(SetId::Boundary));
        debug_assert!(self.sets.is_empty(self.pending_roots));
        debug_assert!(self.sets.is_empty(self.unprocessed));

        self.pending_roots = match self.pending_roots {
            SetId::RootA => SetId::RootB,
            _ => SetId::RootA,
        };
        self.unprocessed = match self.unprocessed {
            SetId::SurvivorA => SetId::SurvivorB,
            _ => SetId::SurvivorA,
        };
        self.epochs += 1;
        self.quiet_epochs += 1;

        #[cfg(feature = "tracing")]
        tracing::debug!(epoch = self.epochs, quiet = self.quiet_epochs, "epoch_reset");
    }

    // ---- diagnostics ---------------------------------------------------

    /// Diagnostic probe: is `h` reachable from any currently locked root
    /// through [`Trace`] alone?
    ///
    /// Used by the test suite as the soundness oracle. Walks the graph
    /// iteratively, cutting cycles with the transient search mark; every
    /// mark is cleared again before returning.
    pub fn is_reachable_from_roots(&mut self, h: Handle) -> bool {
        let Some(target) = self.live_index(h) else {
            return false;
        };

        let mut stack: Vec<u32> = Vec::new();
        for set in [SetId::RootA, SetId::RootB] {
            for idx in self.sets.iter(set) {
                if self.heap.slot(idx).header.locked {
                    stack.push(idx);
                }
            }
        }

        let mut marked: Vec<u32> = Vec::new();
        let mut links: Vec<Handle> = Vec::new();
        let mut found = false;
        while let Some(idx) = stack.pop() {
            if self.heap.slot(idx).header.searching {
                continue;
            }
            self.heap.slot_mut(idx).header.searching = true;
            marked.push(idx);
            if idx == target {
                found = true;
                break;
            }
            links.clear();
            self.heap.payload(idx).trace(&mut Visitor::new(&mut links));
            for &link in &links {
                if let Some(next) = self.live_index(link) {
                    stack.push(next);
                }
            }
        }

        for idx in marked {
            self.heap.slot_mut(idx).header.searching = false;
        }
        found
    }

    // ---- statistics ----------------------------------------------------

    /// Lifetime collector statistics.
    pub fn stats(&self) -> GcStats {
        GcStats {
            total_allocated: self.heap.total_allocated(),
            total_freed: self.heap.total_freed(),
            steps: self.steps,
            epochs: self.epochs,
        }
    }

    /// Current arena occupancy.
    pub fn heap_stats(&self) -> HeapStats {
        let free_slots = self.sets.len(SetId::Free);
        HeapStats {
            live_cells: self.heap.capacity() - free_slots,
            free_slots,
            capacity: self.heap.capacity(),
        }
    }

    // ---- internals -----------------------------------------------------

    #[inline]
    fn reachable_set(&self) -> SetId {
        match self.unprocessed {
            SetId::SurvivorA => SetId::SurvivorB,
            _ => SetId::SurvivorA,
        }
    }

    #[inline]
    fn processed_roots(&self) -> SetId {
        match self.pending_roots {
            SetId::RootA => SetId::RootB,
            _ => SetId::RootA,
        }
    }

    /// Slot index for a handle that still names a live cell.
    fn live_index(&self, h: Handle) -> Option<u32> {
        let idx = h.index();
        if idx as usize >= self.heap.capacity() {
            return None;
        }
        let slot = self.heap.slot(idx);
        if slot.header.generation != h.generation() || slot.payload.is_none() {
            return None;
        }
        Some(idx)
    }

    fn expect_live(&self, h: Handle, op: &str) -> u32 {
        self.live_index(h)
            .unwrap_or_else(|| panic!("{op} on reclaimed cell {h}"))
    }
}

impl<T: Trace> Default for Collector<T> {
    fn default() -> Collector<T> {
        Collector::new()
    }
}

impl<T: Trace + fmt::Debug> Collector<T> {
    /// Write a diagnostic listing of every live cell to `out`.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        for set in [
            SetId::RootA,
            SetId::RootB,
            SetId::Boundary,
            SetId::SurvivorA,
            SetId::SurvivorB,
            SetId::FreePending,
        ] {
            for idx in self.sets.iter(set) {
                let slot = self.heap.slot(idx);
                let handle = Handle::new(idx, slot.header.generation);
                writeln!(
                    out,
                    "{handle} {:?} rc={} locked={} {:?}",
                    self.state_of_index(idx),
                    slot.header.refcount,
                    slot.header.locked,
                    slot.payload.as_ref().expect("live cell without payload"),
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Node(Vec<Handle>);

    impl Trace for Node {
        fn trace(&self, visitor: &mut Visitor<'_>) {
            for &link in &self.0 {
                visitor.visit(link);
            }
        }
    }

    fn leaf(gc: &mut Collector<Node>) -> Handle {
        gc.alloc(Node(Vec::new())).unwrap()
    }

    #[test]
    fn test_alloc_starts_unprocessed() {
        let mut gc = Collector::new();
        let h = leaf(&mut gc);

        assert_eq!(gc.state_of(h), CellState::Unprocessed);
        assert_eq!(gc.refcount(h), 0);
        assert!(gc.is_live(h));
        assert!(!gc.is_locked(h));
        assert!(!gc.is_root(h));
    }

    #[test]
    fn test_lock_is_idempotent() {
        let mut gc = Collector::new();
        let h = leaf(&mut gc);

        gc.lock(h);
        assert_eq!(gc.state_of(h), CellState::RootUnprocessed);

        gc.lock(h);
        assert_eq!(gc.state_of(h), CellState::RootUnprocessed);
        assert!(gc.is_root(h));
        assert!(gc.is_locked(h));
    }

    #[test]
    fn test_new_link_promotes_unprocessed() {
        let mut gc = Collector::new();
        let h = leaf(&mut gc);

        gc.advise_new_link(h);
        assert_eq!(gc.refcount(h), 1);
        assert_eq!(gc.state_of(h), CellState::Boundary);

        gc.advise_new_link(h);
        assert_eq!(gc.refcount(h), 2);
        assert_eq!(gc.state_of(h), CellState::Boundary);
    }

    #[test]
    fn test_stale_link_queues_for_reclamation() {
        let mut gc = Collector::new();
        let h = leaf(&mut gc);
        gc.advise_new_link(h);

        gc.advise_stale_link(h);
        assert_eq!(gc.refcount(h), 0);
        assert_eq!(gc.state_of(h), CellState::FreePending);

        // a release past zero is a no-op, not an underflow
        gc.advise_stale_link(h);
        assert_eq!(gc.refcount(h), 0);
        assert_eq!(gc.state_of(h), CellState::FreePending);
    }

    #[test]
    fn test_unlock_with_references_moves_to_boundary() {
        let mut gc = Collector::new();
        let h = leaf(&mut gc);
        gc.advise_new_link(h);
        gc.lock(h);

        gc.unlock(h);
        assert_eq!(gc.state_of(h), CellState::Boundary);
        assert!(!gc.is_locked(h));
    }

    #[test]
    fn test_unlock_without_references_queues_for_reclamation() {
        let mut gc = Collector::new();
        let h = leaf(&mut gc);
        gc.lock(h);

        gc.unlock(h);
        assert_eq!(gc.state_of(h), CellState::FreePending);
    }

    #[test]
    #[should_panic(expected = "not a root")]
    fn test_unlock_of_non_root_is_fatal() {
        let mut gc = Collector::new();
        let h = leaf(&mut gc);
        gc.unlock(h);
    }

    #[test]
    fn test_empty_collector_goes_stable() {
        let mut gc: Collector<Node> = Collector::new();

        assert!(!gc.step()); // first epoch reset
        assert!(!gc.step()); // second epoch reset
        assert!(gc.step()); // stable
        assert_eq!(gc.stats().epochs, 2);

        assert!(gc.step()); // stays stable without doing work
        assert_eq!(gc.stats().epochs, 2);
    }

    #[test]
    fn test_allocation_disturbs_stability() {
        let mut gc: Collector<Node> = Collector::new();
        gc.run_to_quiescence();

        let h = leaf(&mut gc);
        assert!(!gc.step());

        gc.run_to_quiescence();
        assert!(!gc.is_live(h));
        assert_eq!(gc.state_of(h), CellState::Free);
    }

    #[test]
    fn test_root_survives_collection() {
        let mut gc = Collector::new();
        let h = leaf(&mut gc);
        gc.lock(h);

        gc.run_to_quiescence();
        assert!(gc.is_live(h));
        assert!(gc.is_root(h));
    }

    #[test]
    fn test_stats_reconcile_with_heap() {
        let mut gc = Collector::new();
        let kept = leaf(&mut gc);
        let _dropped = leaf(&mut gc);
        gc.lock(kept);

        gc.run_to_quiescence();

        let stats = gc.stats();
        let heap = gc.heap_stats();
        assert_eq!(stats.total_allocated, 2);
        assert_eq!(stats.total_freed, 1);
        assert_eq!(heap.live_cells, 1);
        assert_eq!(heap.live_cells + heap.free_slots, heap.capacity);
    }

    #[test]
    fn test_dump_lists_live_cells() {
        let mut gc = Collector::new();
        let h = leaf(&mut gc);
        gc.lock(h);

        let mut out = String::new();
        gc.dump(&mut out).unwrap();
        assert!(out.contains("rc=0"));
        assert!(out.contains("locked=true"));
    }
}
