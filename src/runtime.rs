// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The per-thread runtime: scheduler loop, queues, and the switch seam.
//!
//! One runtime exists per OS thread that called [`init`]; it owns every
//! queue, the fiber arena, the stack pool and the event system. There is no
//! internal locking: exactly one fiber runs at a time and only that fiber
//! (or the scheduler context) mutates runtime state, always between a state
//! transition and the following switch.
//!
//! # The switch seam
//!
//! Runtime state is reached through [`with`], which hands out a short-lived
//! `&mut Runtime`. No such borrow may be held across a context switch:
//! every parking path first finishes its bookkeeping inside `with`, lets
//! the borrow end, and only then performs the raw stack switch with the two
//! pointers it extracted. The scheduler context does the same in reverse.

use core::cell::Cell;
use core::ptr;
use std::io;

use crate::arch;
use crate::error::Error;
use crate::event::EventSystem;
use crate::fiber::{Fiber, FiberFlags, FiberId, FiberState};
use crate::poll::{self, PollFd};
use crate::queue::{FiberSlab, LinkSet, Queue};
use crate::slab::Slab;
use crate::sleep::SleepHeap;
use crate::stack::{Stack, StackPool};
use crate::sync::cond::CondRecord;
use crate::sync::mutex::MutexRecord;
use crate::time::ClockState;

/// Stack size of the scheduler context and the idle fiber. Both run only
/// runtime code, but dispatch formats tracing events, so this is not tiny.
const SERVICE_STACK_SIZE: usize = 256 * 1024;

/// A fiber parked in [`poll`](crate::poll::poll), waiting for readiness on
/// a set of descriptors. `pds` points into the owner's stack frame, which
/// is pinned for exactly as long as the entry is linked.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IoEntry {
    pub(crate) fiber: FiberId,
    pub(crate) pds: *mut PollFd,
    pub(crate) npds: usize,
}

pub(crate) struct Runtime {
    pub(crate) fibers: FiberSlab,
    pub(crate) run_q: Queue,
    pub(crate) zombie_q: Queue,
    pub(crate) io_q: Vec<IoEntry>,
    pub(crate) sleep_q: SleepHeap,
    pub(crate) current: Option<FiberId>,
    pub(crate) idle: FiberId,
    /// Saved stack pointer of the scheduler context.
    pub(crate) sched_sp: usize,
    /// The scheduler context's stack; kept alive for the runtime's life.
    #[expect(dead_code, reason = "owns the scheduler stack mapping")]
    sched_stack: Option<Stack>,
    /// Scratch save-slot for the final switch of an exiting fiber.
    pub(crate) dead_sp: usize,
    /// Fiber that performed its final switch and awaits arena removal.
    pub(crate) graveyard: Option<FiberId>,
    /// Live fibers, excluding the idle fiber.
    pub(crate) active_count: usize,
    pub(crate) stacks: StackPool,
    pub(crate) events: EventSystem,
    pub(crate) clock: ClockState,
    pub(crate) conds: Slab<CondRecord>,
    pub(crate) mutexes: Slab<MutexRecord>,
    pub(crate) fls: crate::fls::FlsTable,
}

thread_local! {
    static RUNTIME: Cell<*mut Runtime> = const { Cell::new(ptr::null_mut()) };
}

/// Initializes the runtime on the calling thread.
///
/// The calling thread becomes the primordial fiber. Calling `init` on an
/// already initialized thread is a no-op.
pub fn init() -> Result<(), Error> {
    if !RUNTIME.with(Cell::get).is_null() {
        return Ok(());
    }
    let rt = Runtime::new()?;
    RUNTIME.with(|cell| cell.set(Box::into_raw(rt)));
    tracing::debug!("runtime initialized");
    Ok(())
}

/// Grants access to the thread's runtime, or [`Error::InvalidArg`] when
/// [`init`] has not run on this thread.
///
/// The borrow must not be held across a context switch; see the module
/// docs. Nested calls are a bug and the internal API is arranged so they
/// cannot happen: runtime internals take `&mut Runtime`, user callbacks run
/// outside any `with`.
pub(crate) fn with<R>(f: impl FnOnce(&mut Runtime) -> R) -> Result<R, Error> {
    let ptr = RUNTIME.with(Cell::get);
    if ptr.is_null() {
        return Err(Error::InvalidArg);
    }
    // Safety: the runtime is confined to this thread and `f` cannot
    // re-enter `with` per the arrangement above, so the borrow is unique.
    Ok(f(unsafe { &mut *ptr }))
}

impl Runtime {
    fn new() -> Result<Box<Self>, Error> {
        let mut rt = Box::new(Runtime {
            fibers: FiberSlab::new(),
            run_q: Queue::new(LinkSet::Sched),
            zombie_q: Queue::new(LinkSet::Sched),
            io_q: Vec::new(),
            sleep_q: SleepHeap::new(),
            current: None,
            idle: FiberId {
                key: crate::slab::Key::NIL,
            },
            sched_sp: 0,
            sched_stack: None,
            dead_sp: 0,
            graveyard: None,
            active_count: 0,
            stacks: StackPool::new(),
            events: EventSystem::new()?,
            clock: ClockState::new(),
            conds: Slab::new(),
            mutexes: Slab::new(),
            fls: crate::fls::FlsTable::new(),
        });

        // The thread that called init *is* the primordial fiber.
        let primordial = rt.create_primordial();
        rt.current = Some(primordial);

        // Scheduler context: a pooled stack seeded to enter schedule_loop
        // on the first switch out of a fiber.
        let stack = rt.stacks.allocate(SERVICE_STACK_SIZE)?;
        // Safety: fresh 16-byte-aligned stack top
        rt.sched_sp = unsafe { arch::init_stack(stack.top(), sched_trampoline) };
        rt.sched_stack = Some(stack);

        // The idle fiber; selected by name when the run queue is empty,
        // never linked into it, never counted active.
        let entry: crate::fiber::Entry = Box::new(|| idle_loop());
        rt.idle = rt.create_fiber(entry, SERVICE_STACK_SIZE, false, true)?;

        Ok(rt)
    }

    fn create_primordial(&mut self) -> FiberId {
        let mut fiber = Fiber::bare();
        fiber.state = FiberState::Running;
        fiber.flags.insert(FiberFlags::PRIMORDIAL);
        let key = self.fibers.insert(Box::new(fiber));
        let id = FiberId { key };
        self.fibers.fiber_mut(id).id = id;
        self.active_count += 1;
        id
    }

    /// Detaches the I/O queue entry at `idx`, fixing up the bookkeeping of
    /// the entry that gets swapped into its place.
    pub(crate) fn io_q_detach(&mut self, idx: usize) -> IoEntry {
        let entry = self.io_q.swap_remove(idx);
        if let Some(moved) = self.io_q.get(idx) {
            let moved_fiber = moved.fiber;
            self.fibers.fiber_mut(moved_fiber).ioq_idx = Some(idx);
        }
        self.fibers.fiber_mut(entry.fiber).ioq_idx = None;
        entry
    }

    /// One idle round: wait for readiness (bounded by the nearest sleep
    /// deadline) and make every fiber whose descriptors fired runnable.
    pub(crate) fn dispatch(&mut self) {
        self.events.check_fork();

        let timeout_us = self.sleep_q.peek().map(|root| {
            self.fibers
                .fiber(root)
                .deadline
                .saturating_sub(self.clock.last_clock)
        });

        if let Err(err) = self.events.wait(timeout_us) {
            if err.kind() == io::ErrorKind::Interrupted {
                return;
            }
            panic!("readiness wait failed: {err}");
        }

        let mut woken = 0usize;
        let mut idx = 0;
        while idx < self.io_q.len() {
            let entry = self.io_q[idx];
            // Safety: the owner is parked in IoWait, so the request slice
            // on its stack is pinned and nothing else aliases it.
            let pds = unsafe { std::slice::from_raw_parts_mut(entry.pds, entry.npds) };

            let mut ready = 0usize;
            for pd in pds.iter_mut() {
                pd.revents = poll::ready_subset(self.events.revents(pd.fd), pd.events);
                if !pd.revents.is_empty() {
                    ready += 1;
                }
            }
            if ready == 0 {
                idx += 1;
                continue;
            }

            self.io_q_detach(idx);
            // Consumes the registered interest; by construction only
            // descriptors with no more pending readiness are detached
            // from the backend here.
            self.events.pollset_del(pds);
            if self
                .fibers
                .fiber(entry.fiber)
                .flags
                .contains(FiberFlags::ON_SLEEP_HEAP)
            {
                self.sleep_q.remove(&mut self.fibers, entry.fiber);
            }
            self.fibers.fiber_mut(entry.fiber).state = FiberState::Runnable;
            self.run_q.push_back(&mut self.fibers, entry.fiber);
            woken += 1;
        }

        // One-shot semantics: interest that fired is dropped or re-derived
        // from the remaining reference counts.
        self.events.consume();

        if woken > 0 {
            tracing::trace!(woken, "dispatch woke I/O waiters");
        }
    }
}

/// Suspends the current fiber and resumes the scheduler context.
///
/// The caller must already have transitioned the fiber out of `Running`
/// and linked it wherever it is supposed to wait. Returns when the
/// scheduler picks this fiber again.
pub(crate) fn park_switch() {
    let (save, target) = with(|rt| {
        let me = rt.current.expect("park without a current fiber");
        debug_assert_ne!(
            rt.fibers.fiber(me).state,
            FiberState::Running,
            "parking fiber did not transition its state",
        );
        let save = &raw mut rt.fibers.fiber_mut(me).ctx_sp;
        (save, rt.sched_sp)
    })
    .expect("park outside a runtime");

    // Safety: the scheduler context is suspended and its stack is live; no
    // runtime borrow is held across the switch.
    unsafe { arch::switch(save, target) };
}

extern "C" fn sched_trampoline() -> ! {
    schedule_loop()
}

/// The scheduler context: picks the run-queue head (or the idle fiber) and
/// swaps into it, forever, until the last active fiber exits.
fn schedule_loop() -> ! {
    loop {
        let next = with(|rt| {
            // A fiber that performed its final switch is freed here, on
            // the scheduler stack, where its own stack is guaranteed dead.
            if let Some(dead) = rt.graveyard.take() {
                let removed = rt.fibers.remove(dead.key);
                debug_assert!(removed.is_some());
            }

            if rt.active_count == 0 {
                return None;
            }
            let id = rt.run_q.pop_front(&mut rt.fibers).unwrap_or(rt.idle);
            rt.current = Some(id);
            rt.fibers.fiber_mut(id).state = FiberState::Running;
            let target = rt.fibers.fiber(id).ctx_sp;
            Some((&raw mut rt.sched_sp, target))
        })
        .expect("scheduler outside a runtime");

        match next {
            // Safety: target is a suspended fiber context with a live stack.
            Some((save, target)) => unsafe { arch::switch(save, target) },
            None => {
                tracing::debug!("last active fiber exited, terminating");
                std::process::exit(0);
            }
        }
    }
}

/// The idle fiber: runs the event dispatch whenever nothing is runnable.
fn idle_loop() -> ! {
    loop {
        with(|rt| {
            rt.dispatch();
            rt.check_clock();
            let me = rt.current.expect("idle fiber lost itself");
            rt.fibers.fiber_mut(me).state = FiberState::Runnable;
        })
        .expect("idle fiber outside a runtime");
        park_switch();
    }
}

/// Counter snapshot of the runtime's moving parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Live fibers, including the primordial one, excluding idle.
    pub active_fibers: usize,
    /// Stacks parked on the free list.
    pub pooled_stacks: usize,
    /// Fibers on the sleep heap.
    pub sleeping: usize,
    /// Fibers parked on descriptor readiness.
    pub io_waiting: usize,
}

/// Snapshot of runtime counters; cheap, for tests and introspection.
pub fn stats() -> Result<Stats, Error> {
    with(|rt| Stats {
        active_fibers: rt.active_count,
        pooled_stacks: rt.stacks.len(),
        sleeping: rt.sleep_q.len(),
        io_waiting: rt.io_q.len(),
    })
}

/// Soft limit on open file descriptors for this process.
pub fn fd_limit() -> usize {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // Safety: rl is a valid out-pointer
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } == 0 {
        rl.rlim_cur as usize
    } else {
        0
    }
}
