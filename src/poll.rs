// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Parking on file-descriptor readiness.
//!
//! [`poll`] is the only way a fiber waits for I/O; the wrappers in
//! [`net`](crate::net) are loops over a non-blocking syscall and this
//! function. The shape mirrors poll(2): a slice of per-descriptor requests
//! whose `revents` are filled in by the dispatcher when it wakes the fiber.

use core::time::Duration;
use std::os::fd::RawFd;

use bitflags::bitflags;

use crate::error::Error;
use crate::fiber::{FiberFlags, FiberState};
use crate::runtime::{self, IoEntry};

bitflags! {
    /// Readiness conditions, requested and reported.
    ///
    /// [`ERROR`] and [`HANGUP`] are report-only: they are delivered to
    /// every waiter on the descriptor whether requested or not, like the
    /// poll(2) contract.
    ///
    /// [`ERROR`]: Events::ERROR
    /// [`HANGUP`]: Events::HANGUP
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Events: u32 {
        const READABLE    = 1 << 0;
        const WRITABLE    = 1 << 1;
        const EXCEPTIONAL = 1 << 2;
        const ERROR       = 1 << 3;
        const HANGUP      = 1 << 4;
    }
}

impl Events {
    /// The bits a waiter may register interest in.
    pub(crate) const REQUESTABLE: Events = Events::READABLE
        .union(Events::WRITABLE)
        .union(Events::EXCEPTIONAL);
}

impl Default for Events {
    fn default() -> Self {
        Events::empty()
    }
}

/// One descriptor of a [`poll`] request.
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    pub fd: RawFd,
    /// Conditions to wait for.
    pub events: Events,
    /// Conditions observed; filled in before the fiber wakes.
    pub revents: Events,
}

impl PollFd {
    pub fn new(fd: RawFd, events: Events) -> Self {
        Self {
            fd,
            events,
            revents: Events::empty(),
        }
    }
}

/// The `revents` a waiter interested in `requested` observes when the
/// descriptor reports `fired`: the requested subset, plus error and hangup
/// unconditionally.
pub(crate) fn ready_subset(fired: Events, requested: Events) -> Events {
    (fired & (requested & Events::REQUESTABLE)) | (fired & (Events::ERROR | Events::HANGUP))
}

/// Parks the calling fiber until at least one descriptor in `pds` is
/// ready, the timeout elapses, or the fiber is interrupted.
///
/// Returns the number of descriptors with non-empty `revents`; `Ok(0)`
/// means the timeout elapsed. `None` waits indefinitely.
pub fn poll(pds: &mut [PollFd], timeout: Option<Duration>) -> Result<usize, Error> {
    let npds = pds.len();

    runtime::with(|rt| -> Result<(), Error> {
        let me = rt.current.expect("poll outside a fiber");
        {
            let fiber = rt.fibers.fiber_mut(me);
            if fiber.flags.contains(FiberFlags::INTERRUPTED) {
                fiber.flags.remove(FiberFlags::INTERRUPTED);
                return Err(Error::Interrupted);
            }
        }

        let limit = rt.events.fd_limit();
        if limit != 0 && npds > limit {
            return Err(Error::InvalidArg);
        }
        for pd in pds.iter_mut() {
            pd.revents = Events::empty();
        }

        rt.events.pollset_add(pds)?;

        rt.io_q.push(IoEntry {
            fiber: me,
            pds: pds.as_mut_ptr(),
            npds,
        });
        rt.fibers.fiber_mut(me).ioq_idx = Some(rt.io_q.len() - 1);

        if let Some(timeout) = timeout {
            let us = u64::try_from(timeout.as_micros()).unwrap_or(u64::MAX);
            let deadline = rt.clock.last_clock.saturating_add(us);
            rt.sleep_q.insert(&mut rt.fibers, me, deadline);
        }
        rt.fibers.fiber_mut(me).state = FiberState::IoWait;
        Ok(())
    })??;

    runtime::park_switch();

    runtime::with(|rt| -> Result<usize, Error> {
        let me = rt.current.expect("poll outside a fiber");
        let n = match rt.fibers.fiber(me).ioq_idx {
            // Still linked: woken by timeout or interrupt, not readiness.
            Some(idx) => {
                rt.io_q_detach(idx);
                rt.events.pollset_del(pds);
                0
            }
            // The dispatcher detached us and populated revents.
            None => pds.iter().filter(|pd| !pd.revents.is_empty()).count(),
        };
        let fiber = rt.fibers.fiber_mut(me);
        if fiber.flags.contains(FiberFlags::INTERRUPTED) {
            fiber.flags.remove(FiberFlags::INTERRUPTED);
            return Err(Error::Interrupted);
        }
        Ok(n)
    })?
}
