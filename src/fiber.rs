// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fibers: creation, exit, join and interrupt.
//!
//! A fiber is a record in the runtime's arena plus a guarded stack. The
//! record carries everything the scheduler and the wait structures need:
//! the state machine position, the flag bits, two intrusive link records,
//! the sleep-heap key, and the saved stack pointer of the suspended
//! context. Only the scheduler changes a fiber's state; the parking
//! primitives cooperate with it by queueing the fiber and yielding.

use core::any::Any;
use core::fmt;
use core::marker::PhantomData;
use std::rc::Rc;

use bitflags::bitflags;

use crate::arch;
use crate::error::Error;
use crate::fls::FLS_KEYS_MAX;
use crate::queue::{FiberSlab, Links, LinkSet};
use crate::runtime::{self, Runtime};
use crate::sync::cond::{self, Cond};

/// Handle to a fiber.
///
/// Handles are plain copyable values; a handle that outlives its fiber is
/// detected and reported as [`Error::InvalidArg`] rather than addressing a
/// recycled record.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId {
    pub(crate) key: crate::slab::Key,
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FiberId({:?})", self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FiberState {
    Running,
    Runnable,
    IoWait,
    LockWait,
    CondWait,
    Sleeping,
    Zombie,
    Suspended,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct FiberFlags: u8 {
        /// The initial user thread; its stack belongs to the OS.
        const PRIMORDIAL   = 1 << 0;
        /// The dispatch fiber; excluded from the active count.
        const IDLE         = 1 << 1;
        /// Reachable from the sleep-heap root.
        const ON_SLEEP_HEAP = 1 << 2;
        /// A pending interrupt; consumed by the next park entry or exit.
        const INTERRUPTED  = 1 << 3;
        /// A condvar wait ran out of time; consumed on resume.
        const TIMED_OUT    = 1 << 4;
    }
}

pub(crate) type Entry = Box<dyn FnOnce() -> Box<dyn Any>>;

pub(crate) struct Fiber {
    pub(crate) id: FiberId,
    pub(crate) state: FiberState,
    pub(crate) flags: FiberFlags,
    /// Taken by the trampoline on first entry.
    pub(crate) entry: Option<Entry>,
    pub(crate) retval: Option<Box<dyn Any>>,
    /// None for the primordial fiber.
    pub(crate) stack: Option<crate::stack::Stack>,
    /// Saved stack pointer; meaningful only while suspended.
    pub(crate) ctx_sp: usize,
    pub(crate) sched_link: Links,
    pub(crate) sync_link: Links,
    /// Absolute wakeup time in microseconds; valid while on the sleep heap.
    pub(crate) deadline: u64,
    /// 1-based position in the sleep heap, 0 when not on it.
    pub(crate) heap_index: usize,
    /// Heap insertion sequence; breaks deadline ties first-in-first-out.
    pub(crate) heap_seq: u64,
    /// Position of this fiber's entry in the I/O queue, if any.
    pub(crate) ioq_idx: Option<usize>,
    pub(crate) fls: [Option<Rc<dyn Any>>; FLS_KEYS_MAX],
    /// Termination condvar; present exactly on joinable fibers.
    pub(crate) term: Option<Cond>,
    /// The single fiber allowed to reap this one.
    pub(crate) joiner: Option<FiberId>,
}

impl Fiber {
    pub(crate) fn bare() -> Self {
        Fiber {
            id: FiberId {
                key: crate::slab::Key::NIL,
            },
            state: FiberState::Runnable,
            flags: FiberFlags::empty(),
            entry: None,
            retval: None,
            stack: None,
            ctx_sp: 0,
            sched_link: Links::default(),
            sync_link: Links::default(),
            deadline: 0,
            heap_index: 0,
            heap_seq: 0,
            ioq_idx: None,
            fls: [const { None }; FLS_KEYS_MAX],
            term: None,
            joiner: None,
        }
    }

    pub(crate) fn links(&self, set: LinkSet) -> &Links {
        match set {
            LinkSet::Sched => &self.sched_link,
            LinkSet::Sync => &self.sync_link,
        }
    }

    pub(crate) fn links_mut(&mut self, set: LinkSet) -> &mut Links {
        match set {
            LinkSet::Sched => &mut self.sched_link,
            LinkSet::Sync => &mut self.sync_link,
        }
    }

    /// Inserts a default record, for data-structure unit tests.
    #[cfg(test)]
    pub(crate) fn insert_bare(fibers: &mut FiberSlab) -> FiberId {
        insert(fibers, Fiber::bare())
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

fn insert(fibers: &mut FiberSlab, fiber: Fiber) -> FiberId {
    let key = fibers.insert(Box::new(fiber));
    let id = FiberId { key };
    fibers.fiber_mut(id).id = id;
    id
}

impl Runtime {
    /// Builds a fiber record on a pooled stack and, unless it is the idle
    /// fiber, counts it active and queues it runnable.
    pub(crate) fn create_fiber(
        &mut self,
        entry: Entry,
        stack_size: usize,
        joinable: bool,
        idle: bool,
    ) -> Result<FiberId, Error> {
        let stack = self.stacks.allocate(stack_size)?;
        // Safety: fresh 16-byte-aligned stack top with room for the frame
        let ctx_sp = unsafe { arch::init_stack(stack.top(), fiber_trampoline) };

        let mut fiber = Fiber::bare();
        fiber.entry = Some(entry);
        fiber.stack = Some(stack);
        fiber.ctx_sp = ctx_sp;
        if joinable {
            fiber.term = Some(cond::create(self));
        }
        if idle {
            fiber.flags.insert(FiberFlags::IDLE);
        }
        let id = insert(&mut self.fibers, fiber);

        if !idle {
            self.active_count += 1;
            self.run_q.push_back(&mut self.fibers, id);
        }
        tracing::debug!(fiber = ?id, joinable, idle, "fiber created");
        Ok(id)
    }

    pub(crate) fn interrupt_fiber(&mut self, target: FiberId) -> Result<(), Error> {
        let state = match self.fibers.get(target.key) {
            Some(fiber) => fiber.state,
            None => return Err(Error::InvalidArg),
        };
        if state == FiberState::Zombie {
            return Ok(());
        }
        self.fibers
            .fiber_mut(target)
            .flags
            .insert(FiberFlags::INTERRUPTED);
        match state {
            // The flag is observed on the next parking call.
            FiberState::Running | FiberState::Runnable => {}
            // Parked: force the fiber runnable; its parking primitive
            // observes the flag on resume and fails with Interrupted.
            FiberState::IoWait
            | FiberState::LockWait
            | FiberState::CondWait
            | FiberState::Sleeping
            | FiberState::Suspended => {
                if self
                    .fibers
                    .fiber(target)
                    .flags
                    .contains(FiberFlags::ON_SLEEP_HEAP)
                {
                    self.sleep_q.remove(&mut self.fibers, target);
                }
                self.fibers.fiber_mut(target).state = FiberState::Runnable;
                self.run_q.push_back(&mut self.fibers, target);
            }
            FiberState::Zombie => unreachable!(),
        }
        tracing::trace!(fiber = ?target, ?state, "fiber interrupted");
        Ok(())
    }
}

/// First frame of every fiber: runs the entry closure, then the exit path.
///
/// A panic unwinding out of the closure crosses this `extern "C"` boundary
/// and aborts the process; unwinding across a stack switch is not
/// supported.
pub(crate) extern "C" fn fiber_trampoline() -> ! {
    let entry = runtime::with(|rt| {
        let me = rt.current.expect("fiber trampoline without a current fiber");
        rt.fibers
            .fiber_mut(me)
            .entry
            .take()
            .expect("fiber entered twice")
    })
    .expect("fiber trampoline outside a runtime");

    let retval = entry();
    finish(retval)
}

/// Common exit path for returning entry closures and explicit [`exit`].
pub(crate) fn finish(retval: Box<dyn Any>) -> ! {
    runtime::with(|rt| {
        let me = rt.current.expect("exit outside a fiber");
        rt.fibers.fiber_mut(me).retval = Some(retval);
    })
    .expect("exit outside a runtime");

    // Fiber-local destructors are user code; run them before this fiber
    // stops being "current".
    crate::fls::run_destructors();

    let joinable = runtime::with(|rt| {
        let me = rt.current.expect("exit outside a fiber");
        let fiber = rt.fibers.fiber(me);
        if !fiber.flags.contains(FiberFlags::IDLE) {
            rt.active_count -= 1;
        }
        fiber.term.is_some()
    })
    .expect("exit outside a runtime");

    if joinable {
        runtime::with(|rt| {
            let me = rt.current.expect("exit outside a fiber");
            rt.fibers.fiber_mut(me).state = FiberState::Zombie;
            rt.zombie_q.push_back(&mut rt.fibers, me);
            let term = rt
                .fibers
                .fiber(me)
                .term
                .expect("joinable fiber without termination condvar");
            rt.wake_waiters(term, false);
        })
        .expect("exit outside a runtime");

        // Parks as a zombie until the joiner reaps and requeues us.
        runtime::park_switch();

        runtime::with(|rt| {
            let me = rt.current.expect("exit outside a fiber");
            let term = rt
                .fibers
                .fiber_mut(me)
                .term
                .take()
                .expect("termination condvar vanished");
            let removed = rt.conds.remove(term.key());
            debug_assert!(removed.is_some());
        })
        .expect("exit outside a runtime");
    }

    let (save, target) = runtime::with(|rt| {
        let me = rt.current.expect("exit outside a fiber");
        tracing::debug!(fiber = ?me, "fiber exiting");
        if let Some(stack) = rt.fibers.fiber_mut(me).stack.take() {
            // We are still running on this stack. Legal: the free list only
            // links the mapping, and nothing can hand it out again before
            // the switch below, after which this stack is never touched.
            rt.stacks.release(stack);
        }
        rt.graveyard = Some(me);
        (&raw mut rt.dead_sp, rt.sched_sp)
    })
    .expect("exit outside a runtime");

    // Safety: the scheduler context is suspended and its stack is live.
    unsafe { arch::switch(save, target) };
    unreachable!("terminated fiber was resumed")
}

/// Terminates the calling fiber with `value` as its return value.
///
/// The stack is not unwound: live locals on the fiber stack are leaked,
/// not dropped. Prefer returning from the entry closure.
pub fn exit<T: 'static>(value: T) -> ! {
    finish(Box::new(value))
}

/// Handle of the calling fiber.
pub fn current() -> Result<FiberId, Error> {
    runtime::with(|rt| rt.current.expect("runtime has no current fiber"))
}

/// Delivers an interrupt to `target`.
///
/// A parked target is forced runnable and its parking call fails with
/// [`Error::Interrupted`]; a running or runnable target fails its *next*
/// parking call instead. Interrupting a zombie is a no-op. One interrupt
/// causes exactly one failed park.
pub fn interrupt(target: FiberId) -> Result<(), Error> {
    runtime::with(|rt| rt.interrupt_fiber(target))?
}

/// Configures and spawns fibers.
///
/// ```no_run
/// fn demo() -> Result<(), strand::Error> {
///     strand::init()?;
///     let handle = strand::Builder::new()
///         .stack_size(256 * 1024)
///         .spawn(|| 7u32)?;
///     assert_eq!(handle.join()?, 7);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    stack_size: usize,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            stack_size: crate::stack::DEFAULT_STACK_SIZE,
        }
    }

    /// Usable stack size for the fiber; clamped to the runtime minimum and
    /// rounded to whole pages.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Spawns a joinable fiber. The caller must eventually [`join`] it;
    /// an unjoined fiber stays a zombie and its stack is never recycled.
    ///
    /// [`join`]: JoinHandle::join
    pub fn spawn<F, T>(self, f: F) -> Result<JoinHandle<T>, Error>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let entry: Entry = Box::new(move || Box::new(f()) as Box<dyn Any>);
        let id =
            runtime::with(move |rt| rt.create_fiber(entry, self.stack_size, true, false))??;
        Ok(JoinHandle {
            id,
            _ret: PhantomData,
        })
    }

    /// Spawns a fire-and-forget fiber; its resources are reclaimed as soon
    /// as it exits.
    pub fn spawn_detached<F>(self, f: F) -> Result<FiberId, Error>
    where
        F: FnOnce() + 'static,
    {
        let entry: Entry = Box::new(move || {
            f();
            Box::new(()) as Box<dyn Any>
        });
        runtime::with(move |rt| rt.create_fiber(entry, self.stack_size, false, false))?
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a joinable fiber with the default stack size.
pub fn spawn<F, T>(f: F) -> Result<JoinHandle<T>, Error>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    Builder::new().spawn(f)
}

/// Owner side of a joinable fiber.
#[derive(Debug)]
pub struct JoinHandle<T> {
    id: FiberId,
    _ret: PhantomData<fn() -> T>,
}

impl<T: 'static> JoinHandle<T> {
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Parks until the fiber terminates and returns its value.
    ///
    /// Fails with [`Error::Interrupted`] if the caller is interrupted while
    /// waiting (the target stays joinable), and with [`Error::Deadlock`]
    /// when a fiber attempts to join itself through a smuggled handle.
    pub fn join(self) -> Result<T, Error> {
        let retval = join_fiber(self.id)?;
        match retval.downcast::<T>() {
            Ok(boxed) => Ok(*boxed),
            // The fiber bailed out through `exit` with a different type.
            Err(_) => Err(Error::InvalidArg),
        }
    }
}

fn join_fiber(target: FiberId) -> Result<Box<dyn Any>, Error> {
    let term = runtime::with(|rt| -> Result<Cond, Error> {
        let me = rt.current.expect("join outside a fiber");
        if me == target {
            return Err(Error::Deadlock);
        }
        let fiber = rt.fibers.get(target.key).ok_or(Error::InvalidArg)?;
        let term = fiber.term.ok_or(Error::InvalidArg)?;
        // Exactly one fiber may await the termination condvar.
        if fiber.joiner.is_some_and(|j| j != me) {
            return Err(Error::InvalidArg);
        }
        rt.fibers.fiber_mut(target).joiner = Some(me);
        Ok(term)
    })??;

    loop {
        let zombie = runtime::with(|rt| rt.fibers.fiber(target).state == FiberState::Zombie)?;
        if zombie {
            break;
        }
        cond::wait_internal(term, None)?;
    }

    runtime::with(|rt| {
        rt.zombie_q.remove(&mut rt.fibers, target);
        let fiber = rt.fibers.fiber_mut(target);
        let retval = fiber
            .retval
            .take()
            .unwrap_or_else(|| Box::new(()) as Box<dyn Any>);
        fiber.state = FiberState::Runnable;
        // Requeue the zombie so it can run its final cleanup pass.
        rt.run_q.push_back(&mut rt.fibers, target);
        tracing::debug!(fiber = ?target, "fiber reaped");
        retval
    })
}
