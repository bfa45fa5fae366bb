// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Time source, clock cache, and timed parking.
//!
//! All deadlines in the runtime are microseconds of the configured time
//! source (monotonic by default). `last_clock` is refreshed once per idle
//! round in [`Runtime::check_clock`] and is the base for new deadlines, so
//! a burst of fibers sleeping in the same scheduler round shares one clock
//! reading. The coarse wall-clock seconds value is cached separately and
//! refreshed at most about once a second.

use core::ptr;
use core::time::Duration;

use crate::error::Error;
use crate::fiber::{FiberFlags, FiberState};
use crate::runtime::{self, Runtime};

/// Minimum age of the coarse seconds cache before it is refreshed.
const SECS_REFRESH_US: u64 = 999_000;

pub(crate) struct ClockState {
    time_fn: fn() -> u64,
    pub(crate) last_clock: u64,
    cache_on: bool,
    cached_secs: libc::time_t,
    last_refresh: u64,
}

impl ClockState {
    pub(crate) fn new() -> Self {
        Self {
            time_fn: default_time_source,
            last_clock: default_time_source(),
            cache_on: false,
            cached_secs: 0,
            last_refresh: 0,
        }
    }

    pub(crate) fn now(&self) -> u64 {
        (self.time_fn)()
    }

    fn refresh_secs(&mut self, now: u64) {
        // Safety: time(2) with a null argument only returns a value
        self.cached_secs = unsafe { libc::time(ptr::null_mut()) };
        self.last_refresh = now;
    }
}

/// Monotonic clock in microseconds.
fn default_time_source() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Safety: ts is a valid out-pointer
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(rc, 0);
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

impl Runtime {
    /// Refreshes the clock and wakes every fiber whose deadline passed.
    ///
    /// Runs once per idle round, after the readiness wait.
    pub(crate) fn check_clock(&mut self) {
        let now = self.clock.now();
        self.clock.last_clock = now;
        if self.clock.cache_on && now.saturating_sub(self.clock.last_refresh) >= SECS_REFRESH_US {
            self.clock.refresh_secs(now);
        }

        while let Some(root) = self.sleep_q.peek() {
            if self.fibers.fiber(root).deadline > now {
                break;
            }
            let _ = self.sleep_q.pop(&mut self.fibers);
            let fiber = self.fibers.fiber_mut(root);
            // A condvar waiter that gets here was not signalled in time.
            if fiber.state == FiberState::CondWait {
                fiber.flags.insert(FiberFlags::TIMED_OUT);
            }
            fiber.state = FiberState::Runnable;
            self.run_q.push_back(&mut self.fibers, root);
            tracing::trace!(fiber = ?root, "sleep deadline reached");
        }
    }
}

/// Current time of the configured source, in microseconds.
///
/// Falls back to the default monotonic source when no runtime is
/// initialized on this thread.
pub fn now_us() -> u64 {
    runtime::with(|rt| rt.clock.now()).unwrap_or_else(|_| default_time_source())
}

/// The clock reading taken by the most recent idle round.
pub fn last_clock_us() -> Result<u64, Error> {
    runtime::with(|rt| rt.clock.last_clock)
}

/// Coarse wall-clock seconds; served from the cache when [`time_cache`] is
/// enabled.
pub fn now_seconds() -> Result<i64, Error> {
    runtime::with(|rt| {
        if rt.clock.cache_on {
            rt.clock.cached_secs as i64
        } else {
            // Safety: time(2) with a null argument only returns a value
            unsafe { libc::time(ptr::null_mut()) as i64 }
        }
    })
}

/// Enables or disables the coarse seconds cache.
pub fn time_cache(on: bool) -> Result<(), Error> {
    runtime::with(|rt| {
        rt.clock.cache_on = on;
        if on {
            let now = rt.clock.now();
            rt.clock.refresh_secs(now);
        }
    })
}

/// Replaces the time source. The new source must be monotonic and report
/// microseconds; all pending deadlines are interpreted against it.
pub fn set_time_source(f: fn() -> u64) -> Result<(), Error> {
    runtime::with(|rt| {
        rt.clock.time_fn = f;
        rt.clock.last_clock = f();
    })
}

/// Parks the calling fiber for at least `us` microseconds.
///
/// Wakes early only for an interrupt, which is reported as
/// [`Error::Interrupted`]. `usleep(0)` parks until the next idle round,
/// which makes it the closest thing to an explicit yield.
pub fn usleep(us: u64) -> Result<(), Error> {
    runtime::with(|rt| -> Result<(), Error> {
        let me = rt.current.expect("usleep outside a fiber");
        let fiber = rt.fibers.fiber_mut(me);
        if fiber.flags.contains(FiberFlags::INTERRUPTED) {
            fiber.flags.remove(FiberFlags::INTERRUPTED);
            return Err(Error::Interrupted);
        }
        fiber.state = FiberState::Sleeping;
        let deadline = rt.clock.last_clock.saturating_add(us);
        rt.sleep_q.insert(&mut rt.fibers, me, deadline);
        Ok(())
    })??;

    runtime::park_switch();

    runtime::with(|rt| {
        let me = rt.current.expect("usleep outside a fiber");
        let fiber = rt.fibers.fiber_mut(me);
        if fiber.flags.contains(FiberFlags::INTERRUPTED) {
            fiber.flags.remove(FiberFlags::INTERRUPTED);
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    })?
}

/// [`usleep`] with a `Duration`.
pub fn sleep(duration: Duration) -> Result<(), Error> {
    usleep(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX))
}

/// Parks the calling fiber with no deadline.
///
/// The only way back is an interrupt, reported as [`Error::Interrupted`].
pub fn suspend() -> Result<(), Error> {
    runtime::with(|rt| -> Result<(), Error> {
        let me = rt.current.expect("suspend outside a fiber");
        let fiber = rt.fibers.fiber_mut(me);
        if fiber.flags.contains(FiberFlags::INTERRUPTED) {
            fiber.flags.remove(FiberFlags::INTERRUPTED);
            return Err(Error::Interrupted);
        }
        fiber.state = FiberState::Suspended;
        Ok(())
    })??;

    runtime::park_switch();

    runtime::with(|rt| {
        let me = rt.current.expect("suspend outside a fiber");
        let fiber = rt.fibers.fiber_mut(me);
        if fiber.flags.contains(FiberFlags::INTERRUPTED) {
            fiber.flags.remove(FiberFlags::INTERRUPTED);
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    })?
}
