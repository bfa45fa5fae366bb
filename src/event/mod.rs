// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The event system: ref-counted readiness interest over a wait backend.
//!
//! The registry tracks, per descriptor, how many parked requests want each
//! readiness kind plus the bits the last wait returned. The backend only
//! sees aggregate interest: a syscall is issued when the aggregate mask
//! changes, and the descriptor is deregistered when the mask empties.
//! After a wait, interest that fired is consumed (one-shot): the stored
//! readiness is cleared and the kernel-side registration is re-derived
//! from the remaining counts, so readiness meant for one fiber can never
//! fire again for a fiber that did not ask for it.

mod epoll;

use std::os::fd::RawFd;

use crate::error::Error;
use crate::poll::{Events, PollFd};

use self::epoll::Epoll;

#[derive(Debug, Default, Clone, Copy)]
struct FdRecord {
    rd: u32,
    wr: u32,
    ex: u32,
    /// Readiness returned by the last wait, not yet consumed.
    revents: Events,
}

impl FdRecord {
    /// Aggregate interest, re-derived from the reference counts.
    fn interest(&self) -> Events {
        let mut mask = Events::empty();
        if self.rd > 0 {
            mask |= Events::READABLE;
        }
        if self.wr > 0 {
            mask |= Events::WRITABLE;
        }
        if self.ex > 0 {
            mask |= Events::EXCEPTIONAL;
        }
        mask
    }

    fn bump_up(&mut self, events: Events) {
        if events.contains(Events::READABLE) {
            self.rd += 1;
        }
        if events.contains(Events::WRITABLE) {
            self.wr += 1;
        }
        if events.contains(Events::EXCEPTIONAL) {
            self.ex += 1;
        }
    }

    fn bump_down(&mut self, events: Events) {
        if events.contains(Events::READABLE) {
            self.rd = self.rd.saturating_sub(1);
        }
        if events.contains(Events::WRITABLE) {
            self.wr = self.wr.saturating_sub(1);
        }
        if events.contains(Events::EXCEPTIONAL) {
            self.ex = self.ex.saturating_sub(1);
        }
    }
}

pub(crate) struct EventSystem {
    backend: Epoll,
    fds: Vec<FdRecord>,
    /// Descriptors with unconsumed readiness from the last wait.
    fired: Vec<RawFd>,
    pid: libc::pid_t,
}

impl EventSystem {
    pub(crate) fn new() -> Result<Self, Error> {
        Ok(Self {
            backend: Epoll::new()?,
            fds: Vec::new(),
            fired: Vec::new(),
            // Safety: getpid is always safe to call
            pid: unsafe { libc::getpid() },
        })
    }

    /// Ensures the registry covers `fd`.
    pub(crate) fn fd_new(&mut self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 {
            return Err(Error::InvalidArg);
        }
        let idx = fd as usize;
        if idx >= self.fds.len() {
            self.fds.resize(idx + 1, FdRecord::default());
        }
        Ok(())
    }

    /// Forgets `fd`. Fails with [`Error::Busy`] while any interest remains
    /// registered; close the waiters first.
    pub(crate) fn fd_close(&mut self, fd: RawFd) -> Result<(), Error> {
        if fd < 0 {
            return Err(Error::InvalidArg);
        }
        if let Some(rec) = self.fds.get_mut(fd as usize) {
            if !rec.interest().is_empty() {
                return Err(Error::Busy);
            }
            *rec = FdRecord::default();
        }
        Ok(())
    }

    /// Descriptor capacity of the backend; 0 means unlimited.
    pub(crate) fn fd_limit(&self) -> usize {
        0
    }

    pub(crate) fn revents(&self, fd: RawFd) -> Events {
        self.fds
            .get(fd as usize)
            .map(|rec| rec.revents)
            .unwrap_or_default()
    }

    /// Registers interest for every descriptor of a poll request.
    ///
    /// All-or-nothing: a failure rolls back the reference counts (and any
    /// backend registrations) of the prefix that already succeeded.
    pub(crate) fn pollset_add(&mut self, pds: &[PollFd]) -> Result<(), Error> {
        for i in 0..pds.len() {
            if let Err(err) = self.add_one(&pds[i]) {
                for pd in &pds[..i] {
                    self.del_one(pd);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Drops the interest a poll request registered. Backend failures are
    /// tolerated; a stray registration is collected when the descriptor is
    /// closed.
    pub(crate) fn pollset_del(&mut self, pds: &[PollFd]) {
        for pd in pds {
            self.del_one(pd);
        }
    }

    fn add_one(&mut self, pd: &PollFd) -> Result<(), Error> {
        self.fd_new(pd.fd)?;
        let rec = &mut self.fds[pd.fd as usize];
        let old = rec.interest();
        rec.bump_up(pd.events);
        let new = rec.interest();
        if new == old {
            return Ok(());
        }
        let res = if old.is_empty() {
            self.backend.add(pd.fd, epoll_mask(new))
        } else {
            self.backend.modify(pd.fd, epoll_mask(new))
        };
        if let Err(err) = res {
            self.fds[pd.fd as usize].bump_down(pd.events);
            return Err(err.into());
        }
        Ok(())
    }

    fn del_one(&mut self, pd: &PollFd) {
        let Some(rec) = self.fds.get_mut(pd.fd as usize) else {
            return;
        };
        let old = rec.interest();
        rec.bump_down(pd.events);
        let new = rec.interest();
        let pending = !rec.revents.is_empty();
        if new == old || pending {
            // Unconsumed readiness: the post-wait consume pass settles the
            // kernel-side registration once the readiness is cleared.
            return;
        }
        let res = if new.is_empty() {
            self.backend.delete(pd.fd)
        } else {
            self.backend.modify(pd.fd, epoll_mask(new))
        };
        if let Err(err) = res {
            tracing::trace!(fd = pd.fd, "pollset_del backend failure ignored: {err}");
        }
    }

    /// One readiness wait, bounded by `timeout_us` (`None` waits forever).
    /// Returned events are folded into the per-fd readiness bits.
    pub(crate) fn wait(&mut self, timeout_us: Option<u64>) -> std::io::Result<()> {
        let timeout_ms = match timeout_us {
            None => -1,
            Some(us) => us.div_ceil(1000).min(i32::MAX as u64) as i32,
        };
        let n = self.backend.wait(timeout_ms)?;

        for i in 0..n {
            let ev = self.backend.event(i);
            let fd = ev.u64 as RawFd;
            let Some(rec) = self.fds.get_mut(fd as usize) else {
                continue;
            };

            let mut bits = Events::empty();
            if ev.events & libc::EPOLLIN as u32 != 0 {
                bits |= Events::READABLE;
            }
            if ev.events & libc::EPOLLOUT as u32 != 0 {
                bits |= Events::WRITABLE;
            }
            if ev.events & libc::EPOLLPRI as u32 != 0 {
                bits |= Events::EXCEPTIONAL;
            }
            if ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                if ev.events & libc::EPOLLERR as u32 != 0 {
                    bits |= Events::ERROR;
                }
                if ev.events & libc::EPOLLHUP as u32 != 0 {
                    bits |= Events::HANGUP;
                }
                // An error condition wakes every waiter on the descriptor,
                // whatever it asked for.
                bits |= rec.interest();
            }

            if rec.revents.is_empty() && !bits.is_empty() {
                self.fired.push(fd);
            }
            rec.revents |= bits;
        }
        Ok(())
    }

    /// Consumes the readiness delivered by the last [`wait`]: stored bits
    /// are cleared and the kernel registration is re-derived from the
    /// remaining reference counts (one-shot interest).
    ///
    /// [`wait`]: EventSystem::wait
    pub(crate) fn consume(&mut self) {
        for i in 0..self.fired.len() {
            let fd = self.fired[i];
            let rec = &mut self.fds[fd as usize];
            rec.revents = Events::empty();
            let mask = rec.interest();
            let res = if mask.is_empty() {
                self.backend.delete(fd)
            } else {
                self.backend.modify(fd, epoll_mask(mask))
            };
            if let Err(err) = res {
                tracing::trace!(fd, "one-shot consume backend failure ignored: {err}");
            }
        }
        self.fired.clear();
    }

    /// Fork recovery: when the PID changed since the backend was created,
    /// reopen the wait descriptor and re-register every live interest.
    /// Failure here is fatal; the runtime cannot limp on without a backend.
    pub(crate) fn check_fork(&mut self) {
        // Safety: getpid is always safe to call
        let pid = unsafe { libc::getpid() };
        if pid == self.pid {
            return;
        }
        tracing::warn!("pid changed, rebuilding event backend after fork");
        self.backend
            .rebuild()
            .expect("event backend rebuild after fork failed");
        for (fd, rec) in self.fds.iter().enumerate() {
            let mask = rec.interest();
            if !mask.is_empty() {
                self.backend
                    .add(fd as RawFd, epoll_mask(mask))
                    .expect("re-registering interest after fork failed");
            }
        }
        self.pid = pid;
    }

    #[cfg(test)]
    fn counts(&self, fd: RawFd) -> (u32, u32, u32) {
        let rec = self.fds.get(fd as usize).copied().unwrap_or_default();
        (rec.rd, rec.wr, rec.ex)
    }
}

fn epoll_mask(interest: Events) -> u32 {
    let mut mask = 0u32;
    if interest.contains(Events::READABLE) {
        mask |= libc::EPOLLIN as u32;
    }
    if interest.contains(Events::WRITABLE) {
        mask |= libc::EPOLLOUT as u32;
    }
    if interest.contains(Events::EXCEPTIONAL) {
        mask |= libc::EPOLLPRI as u32;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        // Safety: fds is a valid out-pointer
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        // Safety: fd was returned by pipe()
        unsafe { libc::close(fd) };
    }

    #[test]
    fn add_then_del_is_identity() {
        let mut events = EventSystem::new().unwrap();
        let (rd, wr) = pipe();

        let pds = [
            PollFd::new(rd, Events::READABLE),
            PollFd::new(wr, Events::WRITABLE),
        ];
        events.pollset_add(&pds).unwrap();
        assert_eq!(events.counts(rd), (1, 0, 0));
        assert_eq!(events.counts(wr), (0, 1, 0));

        events.pollset_del(&pds);
        assert_eq!(events.counts(rd), (0, 0, 0));
        assert_eq!(events.counts(wr), (0, 0, 0));
        // With every count back at zero the descriptors may be retired.
        events.fd_close(rd).unwrap();
        events.fd_close(wr).unwrap();

        close(rd);
        close(wr);
    }

    #[test]
    fn refcounts_aggregate_across_requests() {
        let mut events = EventSystem::new().unwrap();
        let (rd, wr) = pipe();

        let a = [PollFd::new(rd, Events::READABLE)];
        let b = [PollFd::new(rd, Events::READABLE | Events::WRITABLE)];
        events.pollset_add(&a).unwrap();
        events.pollset_add(&b).unwrap();
        assert_eq!(events.counts(rd), (2, 1, 0));
        assert!(matches!(events.fd_close(rd), Err(Error::Busy)));

        events.pollset_del(&a);
        assert_eq!(events.counts(rd), (1, 1, 0));
        events.pollset_del(&b);
        assert_eq!(events.counts(rd), (0, 0, 0));

        close(rd);
        close(wr);
    }

    #[test]
    fn bad_fd_add_rolls_back_prefix() {
        let mut events = EventSystem::new().unwrap();
        let (rd, wr) = pipe();

        let pds = [
            PollFd::new(rd, Events::READABLE),
            PollFd::new(-1, Events::READABLE),
        ];
        assert!(events.pollset_add(&pds).is_err());
        // The first descriptor's registration was rolled back.
        assert_eq!(events.counts(rd), (0, 0, 0));
        events.fd_close(rd).unwrap();

        close(rd);
        close(wr);
    }

    #[test]
    fn wait_reports_pipe_readability() {
        let mut events = EventSystem::new().unwrap();
        let (rd, wr) = pipe();

        let pds = [PollFd::new(rd, Events::READABLE)];
        events.pollset_add(&pds).unwrap();

        // Nothing written yet: a zero timeout reports nothing.
        events.wait(Some(0)).unwrap();
        assert_eq!(events.revents(rd), Events::empty());

        // Safety: wr is the write end of the pipe
        assert_eq!(unsafe { libc::write(wr, b"x".as_ptr().cast(), 1) }, 1);
        events.wait(Some(10_000)).unwrap();
        assert_eq!(events.revents(rd), Events::READABLE);

        events.consume();
        assert_eq!(events.revents(rd), Events::empty());
        events.pollset_del(&pds);

        close(rd);
        close(wr);
    }
}
