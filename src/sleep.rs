// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The sleep heap: fibers ordered by absolute wakeup deadline.
//!
//! An indexed binary min-heap over `(deadline, insertion sequence)`. The
//! sequence component makes the order total, so fibers with equal deadlines
//! wake in insertion order no matter how the heap happens to be shaped.
//! Each fiber stores its own 1-based heap position, which buys O(1)
//! deletion by handle — needed when an interrupt or an I/O readiness event
//! pulls a fiber off the heap before its deadline.

use crate::fiber::{FiberFlags, FiberId};
use crate::queue::FiberSlab;

#[derive(Debug, Default)]
pub(crate) struct SleepHeap {
    /// Slot `i` holds the fiber with heap index `i + 1`.
    slots: Vec<FiberId>,
    /// Monotonic insertion counter; the tie-break half of the heap key.
    seq: u64,
}

impl SleepHeap {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            seq: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// The fiber with the smallest deadline, if any.
    pub(crate) fn peek(&self) -> Option<FiberId> {
        self.slots.first().copied()
    }

    /// Schedules `id` for wakeup at absolute time `deadline` (µs).
    pub(crate) fn insert(&mut self, fibers: &mut FiberSlab, id: FiberId, deadline: u64) {
        let seq = self.seq;
        self.seq += 1;
        {
            let fiber = fibers.fiber_mut(id);
            debug_assert!(!fiber.flags.contains(FiberFlags::ON_SLEEP_HEAP));
            fiber.deadline = deadline;
            fiber.heap_seq = seq;
            fiber.flags.insert(FiberFlags::ON_SLEEP_HEAP);
            fiber.heap_index = self.slots.len() + 1;
        }
        self.slots.push(id);
        self.sift_up(fibers, self.slots.len() - 1);
    }

    /// Removes `id` from the heap; O(log n) with O(1) location.
    pub(crate) fn remove(&mut self, fibers: &mut FiberSlab, id: FiberId) {
        let pos = {
            let fiber = fibers.fiber_mut(id);
            debug_assert!(fiber.flags.contains(FiberFlags::ON_SLEEP_HEAP));
            let pos = fiber.heap_index - 1;
            fiber.flags.remove(FiberFlags::ON_SLEEP_HEAP);
            fiber.heap_index = 0;
            pos
        };
        debug_assert_eq!(self.slots[pos], id);

        let last = self.slots.len() - 1;
        self.slots.swap_remove(pos);
        if pos < last {
            // The former last element took over this position and may
            // violate the heap property in either direction.
            fibers.fiber_mut(self.slots[pos]).heap_index = pos + 1;
            self.sift_down(fibers, pos);
            self.sift_up(fibers, pos);
        }
    }

    /// Pops the minimum element.
    pub(crate) fn pop(&mut self, fibers: &mut FiberSlab) -> Option<FiberId> {
        let min = self.peek()?;
        self.remove(fibers, min);
        Some(min)
    }

    fn less(fibers: &FiberSlab, a: FiberId, b: FiberId) -> bool {
        let fa = fibers.fiber(a);
        let fb = fibers.fiber(b);
        (fa.deadline, fa.heap_seq) < (fb.deadline, fb.heap_seq)
    }

    fn sift_up(&mut self, fibers: &mut FiberSlab, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !Self::less(fibers, self.slots[pos], self.slots[parent]) {
                break;
            }
            self.swap(fibers, pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, fibers: &mut FiberSlab, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            if left >= self.slots.len() {
                break;
            }
            // Pick the younger child; left wins ties via the strict compare.
            let right = left + 1;
            let child = if right < self.slots.len()
                && Self::less(fibers, self.slots[right], self.slots[left])
            {
                right
            } else {
                left
            };
            if !Self::less(fibers, self.slots[child], self.slots[pos]) {
                break;
            }
            self.swap(fibers, pos, child);
            pos = child;
        }
    }

    fn swap(&mut self, fibers: &mut FiberSlab, a: usize, b: usize) {
        self.slots.swap(a, b);
        fibers.fiber_mut(self.slots[a]).heap_index = a + 1;
        fibers.fiber_mut(self.slots[b]).heap_index = b + 1;
    }

    /// Heap-shape and bookkeeping invariants, for tests and debug builds.
    #[cfg(test)]
    fn assert_invariants(&self, fibers: &FiberSlab) {
        for (i, &id) in self.slots.iter().enumerate() {
            let fiber = fibers.fiber(id);
            assert_eq!(fiber.heap_index, i + 1, "heap index is stale");
            assert!(fiber.flags.contains(FiberFlags::ON_SLEEP_HEAP));
            for child in [2 * i + 1, 2 * i + 2] {
                if child < self.slots.len() {
                    assert!(
                        !Self::less(fibers, self.slots[child], self.slots[i]),
                        "heap property violated at {i}"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::Fiber;
    use proptest::prelude::*;

    fn setup(deadlines: &[u64]) -> (FiberSlab, SleepHeap, Vec<FiberId>) {
        let mut fibers = FiberSlab::new();
        let mut heap = SleepHeap::new();
        let ids: Vec<_> = deadlines
            .iter()
            .map(|&d| {
                let id = Fiber::insert_bare(&mut fibers);
                heap.insert(&mut fibers, id, d);
                id
            })
            .collect();
        heap.assert_invariants(&fibers);
        (fibers, heap, ids)
    }

    #[test]
    fn pops_in_deadline_order() {
        let (mut fibers, mut heap, _) = setup(&[30, 10, 20, 10, 50]);
        let mut order = Vec::new();
        while let Some(id) = heap.pop(&mut fibers) {
            order.push(fibers.fiber(id).deadline);
        }
        assert_eq!(order, vec![10, 10, 20, 30, 50]);
    }

    #[test]
    fn equal_deadlines_pop_in_insertion_order() {
        let (mut fibers, mut heap, ids) = setup(&[10, 10, 10, 10]);
        let order: Vec<_> = std::iter::from_fn(|| heap.pop(&mut fibers)).collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn remove_from_middle_keeps_shape() {
        let (mut fibers, mut heap, ids) = setup(&[5, 3, 8, 1, 9, 2]);
        heap.remove(&mut fibers, ids[0]);
        heap.remove(&mut fibers, ids[3]);
        heap.assert_invariants(&fibers);
        assert_eq!(heap.len(), 4);
        assert!(!fibers.fiber(ids[0]).flags.contains(FiberFlags::ON_SLEEP_HEAP));
        let mut order = Vec::new();
        while let Some(id) = heap.pop(&mut fibers) {
            order.push(fibers.fiber(id).deadline);
        }
        assert_eq!(order, vec![2, 3, 8, 9]);
    }

    proptest! {
        // Random insert/remove interleavings against a brute-force model,
        // up to the size the runtime realistically sees.
        #[test]
        fn matches_reference_model(
            deadlines in proptest::collection::vec(0u64..64, 1..1024),
            removals in proptest::collection::vec(any::<proptest::sample::Index>(), 0..256),
        ) {
            let (mut fibers, mut heap, ids) = setup(&deadlines);

            // Model: (deadline, insertion index), kept sorted lazily.
            let mut model: Vec<(u64, usize)> =
                deadlines.iter().copied().zip(0..).collect();

            for sel in removals {
                if model.is_empty() {
                    break;
                }
                let victim = sel.index(model.len());
                let (_, idx) = model.remove(victim);
                heap.remove(&mut fibers, ids[idx]);
                heap.assert_invariants(&fibers);
            }

            model.sort();
            let mut popped = Vec::new();
            while let Some(id) = heap.pop(&mut fibers) {
                let f = fibers.fiber(id);
                prop_assert_eq!(f.heap_index, 0);
                popped.push((f.deadline, ids.iter().position(|&x| x == id).unwrap()));
            }
            prop_assert_eq!(popped, model);
        }
    }
}
