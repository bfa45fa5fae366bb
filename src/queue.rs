// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Intrusive FIFO queues of fibers.
//!
//! Queue membership is stored on the fiber itself: each fiber carries two
//! link records, one for the scheduler-owned queues (run queue, zombie
//! queue) and one for synchronization wait queues (condition variables,
//! mutexes), so a fiber can be parked on a condvar while also linked by the
//! scheduler. No nodes are allocated; a queue is just a head/tail pair of
//! handles and the links live in the fiber arena. Removal by handle is O(1)
//! and membership is the `queued` marker, no scanning.

use crate::fiber::{Fiber, FiberId};
use crate::slab::Slab;

pub(crate) type FiberSlab = Slab<Box<Fiber>>;

impl Slab<Box<Fiber>> {
    /// Resolves a fiber known to be live.
    ///
    /// Internal queue and scheduler state only ever holds live handles;
    /// a miss here is a runtime invariant violation.
    #[track_caller]
    pub(crate) fn fiber(&self, id: FiberId) -> &Fiber {
        self.get(id.key).expect("stale fiber handle in runtime state")
    }

    #[track_caller]
    pub(crate) fn fiber_mut(&mut self, id: FiberId) -> &mut Fiber {
        self.get_mut(id.key)
            .expect("stale fiber handle in runtime state")
    }
}

/// One linkage record; every fiber has one per [`LinkSet`].
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Links {
    next: Option<FiberId>,
    prev: Option<FiberId>,
    queued: bool,
}

impl Links {
    #[cfg(test)]
    pub(crate) fn is_queued(&self) -> bool {
        self.queued
    }
}

/// Which of the fiber's two link records a queue threads through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkSet {
    /// Run queue and zombie queue. A fiber is on at most one of these.
    Sched,
    /// Condition-variable and mutex wait queues.
    Sync,
}

#[derive(Debug)]
pub(crate) struct Queue {
    head: Option<FiberId>,
    tail: Option<FiberId>,
    set: LinkSet,
}

impl Queue {
    pub(crate) const fn new(set: LinkSet) -> Self {
        Self {
            head: None,
            tail: None,
            set,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn head(&self) -> Option<FiberId> {
        self.head
    }

    /// The fiber linked after `id`, for manual walks over wait queues.
    pub(crate) fn next(&self, fibers: &FiberSlab, id: FiberId) -> Option<FiberId> {
        fibers.fiber(id).links(self.set).next
    }

    pub(crate) fn push_back(&mut self, fibers: &mut FiberSlab, id: FiberId) {
        let tail = self.tail;
        {
            let links = fibers.fiber_mut(id).links_mut(self.set);
            debug_assert!(!links.queued, "fiber is already queued");
            links.next = None;
            links.prev = tail;
            links.queued = true;
        }
        match tail {
            Some(tail) => fibers.fiber_mut(tail).links_mut(self.set).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    pub(crate) fn pop_front(&mut self, fibers: &mut FiberSlab) -> Option<FiberId> {
        let head = self.head?;
        self.remove(fibers, head);
        Some(head)
    }

    /// Unlinks `id` from anywhere in the queue.
    pub(crate) fn remove(&mut self, fibers: &mut FiberSlab, id: FiberId) {
        let Links {
            next, prev, queued, ..
        } = *fibers.fiber(id).links(self.set);
        debug_assert!(queued, "fiber is not on this queue");
        match prev {
            Some(prev) => fibers.fiber_mut(prev).links_mut(self.set).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => fibers.fiber_mut(next).links_mut(self.set).prev = prev,
            None => self.tail = prev,
        }
        *fibers.fiber_mut(id).links_mut(self.set) = Links::default();
    }
}
