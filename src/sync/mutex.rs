// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Non-recursive mutex with FIFO ownership handoff.

use crate::error::Error;
use crate::fiber::{FiberFlags, FiberId, FiberState};
use crate::queue::{LinkSet, Queue};
use crate::runtime;
use crate::slab::Key;

/// A raw fiber mutex.
///
/// Unlocking hands ownership directly to the longest-parked waiter, so a
/// contender arriving between unlock and the waiter's resume cannot barge
/// in. Non-recursive: re-locking from the owner reports
/// [`Error::Deadlock`]. There is no guard type; this is the runtime's raw
/// locking primitive and pairing lock/unlock is the caller's contract.
///
/// The handle is a plain copyable value; operations on a destroyed mutex
/// fail with [`Error::InvalidArg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutex {
    key: Key,
}

#[derive(Debug)]
pub(crate) struct MutexRecord {
    owner: Option<FiberId>,
    wait_q: Queue,
}

impl MutexRecord {
    fn new() -> Self {
        Self {
            owner: None,
            wait_q: Queue::new(LinkSet::Sync),
        }
    }
}

impl Mutex {
    /// Creates a mutex on the calling thread's runtime.
    pub fn new() -> Result<Mutex, Error> {
        runtime::with(|rt| Mutex {
            key: rt.mutexes.insert(MutexRecord::new()),
        })
    }

    /// Acquires the mutex, parking until ownership is handed over.
    pub fn lock(self) -> Result<(), Error> {
        let acquired = runtime::with(|rt| -> Result<bool, Error> {
            let me = rt.current.expect("lock outside a fiber");
            {
                let fiber = rt.fibers.fiber_mut(me);
                if fiber.flags.contains(FiberFlags::INTERRUPTED) {
                    fiber.flags.remove(FiberFlags::INTERRUPTED);
                    return Err(Error::Interrupted);
                }
            }
            let rec = rt.mutexes.get_mut(self.key).ok_or(Error::InvalidArg)?;
            match rec.owner {
                None => {
                    rec.owner = Some(me);
                    Ok(true)
                }
                Some(owner) if owner == me => Err(Error::Deadlock),
                Some(_) => {
                    rec.wait_q.push_back(&mut rt.fibers, me);
                    rt.fibers.fiber_mut(me).state = FiberState::LockWait;
                    Ok(false)
                }
            }
        })??;
        if acquired {
            return Ok(());
        }

        runtime::park_switch();

        runtime::with(|rt| -> Result<(), Error> {
            let me = rt.current.expect("lock outside a fiber");
            let rec = rt
                .mutexes
                .get_mut(self.key)
                .expect("mutex destroyed while a fiber was parked on it");
            rec.wait_q.remove(&mut rt.fibers, me);
            let owner = rec.owner;
            let fiber = rt.fibers.fiber_mut(me);
            // An interrupt that arrived before the unlocker handed us the
            // mutex stole the wakeup; with ownership, the interrupt stays
            // pending for the next parking call.
            if fiber.flags.contains(FiberFlags::INTERRUPTED) && owner != Some(me) {
                fiber.flags.remove(FiberFlags::INTERRUPTED);
                return Err(Error::Interrupted);
            }
            debug_assert_eq!(owner, Some(me), "woken lock waiter does not own the mutex");
            Ok(())
        })?
    }

    /// Acquires the mutex only if it is free; otherwise [`Error::Busy`].
    pub fn try_lock(self) -> Result<(), Error> {
        runtime::with(|rt| -> Result<(), Error> {
            let me = rt.current.expect("try_lock outside a fiber");
            let rec = rt.mutexes.get_mut(self.key).ok_or(Error::InvalidArg)?;
            match rec.owner {
                None => {
                    rec.owner = Some(me);
                    Ok(())
                }
                Some(_) => Err(Error::Busy),
            }
        })?
    }

    /// Releases the mutex. Fails with [`Error::Perm`] when the caller is
    /// not the owner.
    pub fn unlock(self) -> Result<(), Error> {
        runtime::with(|rt| -> Result<(), Error> {
            let me = rt.current.expect("unlock outside a fiber");
            let rec = rt.mutexes.get_mut(self.key).ok_or(Error::InvalidArg)?;
            if rec.owner != Some(me) {
                return Err(Error::Perm);
            }
            // Hand off to the first fiber still parked in LockWait;
            // interrupted waiters linger on the queue in another state and
            // are skipped.
            let mut next_owner = None;
            let mut cursor = rec.wait_q.head();
            while let Some(id) = cursor {
                cursor = rec.wait_q.next(&rt.fibers, id);
                if rt.fibers.fiber(id).state == FiberState::LockWait {
                    next_owner = Some(id);
                    break;
                }
            }
            rec.owner = next_owner;
            if let Some(id) = next_owner {
                rt.fibers.fiber_mut(id).state = FiberState::Runnable;
                rt.run_q.push_back(&mut rt.fibers, id);
                tracing::trace!(fiber = ?id, "mutex handed off");
            }
            Ok(())
        })?
    }

    /// Destroys the mutex. Fails with [`Error::Busy`] while it is held or
    /// contended.
    pub fn destroy(self) -> Result<(), Error> {
        runtime::with(|rt| -> Result<(), Error> {
            let rec = rt.mutexes.get(self.key).ok_or(Error::InvalidArg)?;
            if rec.owner.is_some() || !rec.wait_q.is_empty() {
                return Err(Error::Busy);
            }
            rt.mutexes.remove(self.key);
            Ok(())
        })?
    }
}
