// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Condition variables.

use core::time::Duration;

use crate::error::Error;
use crate::fiber::{FiberFlags, FiberState};
use crate::queue::{LinkSet, Queue};
use crate::runtime::{self, Runtime};
use crate::slab::Key;

/// A condition variable: a FIFO queue of parked fibers.
///
/// The primitive is not coupled to a mutex. Within the single-threaded
/// scheduler a check-then-wait sequence is atomic provided no parking call
/// happens between the check and [`wait`]; that discipline is the caller's
/// contract.
///
/// The handle is a plain copyable value; operations on a destroyed condvar
/// fail with [`Error::InvalidArg`].
///
/// [`wait`]: Cond::wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cond {
    key: Key,
}

#[derive(Debug)]
pub(crate) struct CondRecord {
    pub(crate) wait_q: Queue,
}

impl CondRecord {
    fn new() -> Self {
        Self {
            wait_q: Queue::new(LinkSet::Sync),
        }
    }
}

/// Mints a condvar record; also used for fiber termination condvars.
pub(crate) fn create(rt: &mut Runtime) -> Cond {
    Cond {
        key: rt.conds.insert(CondRecord::new()),
    }
}

impl Runtime {
    /// Wakes the first (or every) fiber on the wait queue whose state is
    /// still `CondWait`; entries in any other state are skipped. Woken
    /// fibers stay linked — each removes itself when it resumes, so the
    /// waker never touches the waiter's linkage.
    pub(crate) fn wake_waiters(&mut self, cond: Cond, all: bool) {
        let Some(rec) = self.conds.get(cond.key) else {
            return;
        };
        let mut cursor = rec.wait_q.head();
        while let Some(id) = cursor {
            cursor = rec.wait_q.next(&self.fibers, id);
            if self.fibers.fiber(id).state != FiberState::CondWait {
                continue;
            }
            if self
                .fibers
                .fiber(id)
                .flags
                .contains(FiberFlags::ON_SLEEP_HEAP)
            {
                self.sleep_q.remove(&mut self.fibers, id);
            }
            self.fibers.fiber_mut(id).state = FiberState::Runnable;
            self.run_q.push_back(&mut self.fibers, id);
            tracing::trace!(fiber = ?id, "condvar waiter woken");
            if !all {
                break;
            }
        }
    }
}

pub(crate) fn wait_internal(cond: Cond, timeout_us: Option<u64>) -> Result<(), Error> {
    runtime::with(|rt| -> Result<(), Error> {
        if !rt.conds.contains(cond.key) {
            return Err(Error::InvalidArg);
        }
        let me = rt.current.expect("condvar wait outside a fiber");
        {
            let fiber = rt.fibers.fiber_mut(me);
            if fiber.flags.contains(FiberFlags::INTERRUPTED) {
                fiber.flags.remove(FiberFlags::INTERRUPTED);
                return Err(Error::Interrupted);
            }
            fiber.state = FiberState::CondWait;
        }
        rt.conds
            .get_mut(cond.key)
            .expect("condvar record vanished")
            .wait_q
            .push_back(&mut rt.fibers, me);
        if let Some(us) = timeout_us {
            let deadline = rt.clock.last_clock.saturating_add(us);
            rt.sleep_q.insert(&mut rt.fibers, me, deadline);
        }
        Ok(())
    })??;

    runtime::park_switch();

    runtime::with(|rt| -> Result<(), Error> {
        let me = rt.current.expect("condvar wait outside a fiber");
        // Wakers leave us linked; unlink ourselves now.
        rt.conds
            .get_mut(cond.key)
            .expect("condvar destroyed while a fiber was parked on it")
            .wait_q
            .remove(&mut rt.fibers, me);
        let fiber = rt.fibers.fiber_mut(me);
        let interrupted = fiber.flags.contains(FiberFlags::INTERRUPTED);
        let timed_out = fiber.flags.contains(FiberFlags::TIMED_OUT);
        fiber
            .flags
            .remove(FiberFlags::INTERRUPTED | FiberFlags::TIMED_OUT);
        if interrupted {
            Err(Error::Interrupted)
        } else if timed_out {
            Err(Error::TimedOut)
        } else {
            Ok(())
        }
    })?
}

impl Cond {
    /// Creates a condition variable on the calling thread's runtime.
    pub fn new() -> Result<Cond, Error> {
        runtime::with(create)
    }

    pub(crate) fn key(&self) -> Key {
        self.key
    }

    /// Parks until [`signal`]led, [`broadcast`], or interrupted.
    ///
    /// [`signal`]: Cond::signal
    /// [`broadcast`]: Cond::broadcast
    pub fn wait(self) -> Result<(), Error> {
        wait_internal(self, None)
    }

    /// [`wait`](Cond::wait) bounded by `timeout`; an elapsed deadline is
    /// reported as [`Error::TimedOut`].
    pub fn timed_wait(self, timeout: Duration) -> Result<(), Error> {
        let us = u64::try_from(timeout.as_micros()).unwrap_or(u64::MAX);
        wait_internal(self, Some(us))
    }

    /// Wakes the longest-waiting fiber, if any.
    pub fn signal(self) -> Result<(), Error> {
        runtime::with(|rt| -> Result<(), Error> {
            if !rt.conds.contains(self.key) {
                return Err(Error::InvalidArg);
            }
            rt.wake_waiters(self, false);
            Ok(())
        })?
    }

    /// Wakes every waiting fiber, in wait order.
    pub fn broadcast(self) -> Result<(), Error> {
        runtime::with(|rt| -> Result<(), Error> {
            if !rt.conds.contains(self.key) {
                return Err(Error::InvalidArg);
            }
            rt.wake_waiters(self, true);
            Ok(())
        })?
    }

    /// Destroys the condvar. Fails with [`Error::Busy`] while fibers wait
    /// on it.
    pub fn destroy(self) -> Result<(), Error> {
        runtime::with(|rt| -> Result<(), Error> {
            let rec = rt.conds.get(self.key).ok_or(Error::InvalidArg)?;
            if !rec.wait_q.is_empty() {
                return Err(Error::Busy);
            }
            rt.conds.remove(self.key);
            Ok(())
        })?
    }
}
