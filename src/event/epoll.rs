// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The epoll wait backend.
//!
//! Only the syscall surface lives here; reference counting and one-shot
//! consumption are in the registry layer above, so another readiness
//! backend (kqueue, plain poll) could be slotted in behind the same five
//! operations: add, modify, delete, wait, rebuild.

use std::io;
use std::os::fd::RawFd;

#[cfg(not(target_os = "linux"))]
compile_error!("the event backend requires epoll; only Linux is supported");

/// Initial readiness buffer size; doubled whenever a wait fills it.
const INITIAL_EVENTS: usize = 256;

pub(crate) struct Epoll {
    epfd: RawFd,
    events: Vec<libc::epoll_event>,
}

impl Epoll {
    pub(crate) fn new() -> io::Result<Self> {
        Ok(Self {
            epfd: create()?,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENTS],
        })
    }

    pub(crate) fn add(&self, fd: RawFd, mask: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
    }

    pub(crate) fn modify(&self, fd: RawFd, mask: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, mask)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, mask: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        // Safety: epfd is a live epoll descriptor and ev is valid
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits for readiness events; returns how many were delivered.
    pub(crate) fn wait(&mut self, timeout_ms: i32) -> io::Result<usize> {
        // Safety: the buffer is valid for `len` events
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n == self.events.len() {
            // Full buffer; grow so a burst does not need several waits.
            self.events
                .resize(n * 2, libc::epoll_event { events: 0, u64: 0 });
        }
        Ok(n)
    }

    /// The `i`-th event of the last [`wait`](Epoll::wait).
    pub(crate) fn event(&self, i: usize) -> libc::epoll_event {
        self.events[i]
    }

    /// Replaces the wait descriptor after a fork. The caller re-registers
    /// interest; an epoll instance is not inherited usefully across fork.
    pub(crate) fn rebuild(&mut self) -> io::Result<()> {
        let fresh = create()?;
        // Safety: epfd is this process's descriptor (inherited copy)
        unsafe { libc::close(self.epfd) };
        self.epfd = fresh;
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        // Safety: epfd is a live epoll descriptor owned by self
        unsafe { libc::close(self.epfd) };
    }
}

fn create() -> io::Result<RawFd> {
    // Safety: epoll_create1 takes no pointers
    let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if epfd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(epfd)
}
