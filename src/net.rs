// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Blocking-style I/O over non-blocking descriptors.
//!
//! Every wrapper is the same three-step recipe: attempt the non-blocking
//! syscall, park in [`poll`](crate::poll::poll) when it would block, retry.
//! Nothing here suspends except through `poll`. Timeouts are per park, not
//! per call, matching the underlying primitive.

use core::ptr;
use core::time::Duration;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::error::Error;
use crate::poll::{self, Events, PollFd};
use crate::runtime;

/// An owned non-blocking descriptor with fiber-blocking operations.
///
/// Wrapping puts the descriptor into non-blocking mode; from then on all
/// blocking happens in the runtime, never in the kernel.
#[derive(Debug)]
pub struct NetFd {
    fd: RawFd,
}

impl NetFd {
    /// Takes ownership of `fd` and switches it to non-blocking mode.
    pub fn new(fd: RawFd) -> Result<Self, Error> {
        runtime::with(|rt| rt.events.fd_new(fd))??;
        // Safety: fcntl on a caller-provided descriptor
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error().into());
        }
        // Safety: as above
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Closes the descriptor. Fails with [`Error::Busy`] while other
    /// fibers still have interest registered on it.
    pub fn close(self) -> Result<(), Error> {
        runtime::with(|rt| rt.events.fd_close(self.fd))??;
        let fd = self.fd;
        std::mem::forget(self);
        // Safety: fd is owned and no interest remains
        if unsafe { libc::close(fd) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Parks until the descriptor is readable; [`Error::TimedOut`] if the
    /// timeout elapses first.
    pub fn wait_readable(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.wait_for(Events::READABLE, timeout)
    }

    /// Parks until the descriptor is writable.
    pub fn wait_writable(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.wait_for(Events::WRITABLE, timeout)
    }

    fn wait_for(&self, events: Events, timeout: Option<Duration>) -> Result<(), Error> {
        let mut pds = [PollFd::new(self.fd, events)];
        match poll::poll(&mut pds, timeout)? {
            0 => Err(Error::TimedOut),
            _ => Ok(()),
        }
    }

    pub fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize, Error> {
        loop {
            // Safety: buf is a valid writable buffer of its length
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            match io::Error::last_os_error() {
                err if err.kind() == io::ErrorKind::Interrupted => continue,
                err if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_readable(timeout)?;
                }
                err => return Err(err.into()),
            }
        }
    }

    pub fn write(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize, Error> {
        loop {
            // Safety: buf is a valid buffer of its length
            let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            match io::Error::last_os_error() {
                err if err.kind() == io::ErrorKind::Interrupted => continue,
                err if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_writable(timeout)?;
                }
                err => return Err(err.into()),
            }
        }
    }

    /// Writes the whole buffer, parking as often as needed.
    pub fn write_all(&self, mut buf: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        while !buf.is_empty() {
            let n = self.write(buf, timeout)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    /// `recv(2)` with the given flags, parking until the socket is
    /// readable.
    pub fn recv(
        &self,
        buf: &mut [u8],
        flags: libc::c_int,
        timeout: Option<Duration>,
    ) -> Result<usize, Error> {
        loop {
            // Safety: buf is a valid writable buffer of its length
            let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), flags) };
            if n >= 0 {
                return Ok(n as usize);
            }
            match io::Error::last_os_error() {
                err if err.kind() == io::ErrorKind::Interrupted => continue,
                err if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_readable(timeout)?;
                }
                err => return Err(err.into()),
            }
        }
    }

    /// `send(2)` with the given flags, parking until the socket is
    /// writable.
    pub fn send(
        &self,
        buf: &[u8],
        flags: libc::c_int,
        timeout: Option<Duration>,
    ) -> Result<usize, Error> {
        loop {
            // Safety: buf is a valid buffer of its length
            let n = unsafe { libc::send(self.fd, buf.as_ptr().cast(), buf.len(), flags) };
            if n >= 0 {
                return Ok(n as usize);
            }
            match io::Error::last_os_error() {
                err if err.kind() == io::ErrorKind::Interrupted => continue,
                err if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_writable(timeout)?;
                }
                err => return Err(err.into()),
            }
        }
    }

    /// Connects a socket, parking while the connection is in progress.
    pub fn connect(&self, addr: &SocketAddr, timeout: Option<Duration>) -> Result<(), Error> {
        let (storage, len) = sockaddr_from(addr);
        // Safety: storage holds a valid sockaddr of length len
        let rc = unsafe {
            libc::connect(
                self.fd,
                (&raw const storage).cast::<libc::sockaddr>(),
                len,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            // The handshake continues in the background; wait for the
            // socket to become writable, then harvest the outcome.
            Some(libc::EINPROGRESS) | Some(libc::EALREADY) | Some(libc::EINTR) => {}
            Some(libc::EISCONN) => return Ok(()),
            _ => return Err(err.into()),
        }
        self.wait_writable(timeout)?;

        let mut so_error: libc::c_int = 0;
        let mut so_len = size_of::<libc::c_int>() as libc::socklen_t;
        // Safety: so_error/so_len are valid out-pointers
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&raw mut so_error).cast(),
                &mut so_len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().into());
        }
        if so_error != 0 {
            return Err(io::Error::from_raw_os_error(so_error).into());
        }
        Ok(())
    }

    /// Accepts one connection from a listening socket.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<NetFd, Error> {
        loop {
            // Safety: null address out-pointers are allowed by accept(2)
            let n = unsafe { libc::accept(self.fd, ptr::null_mut(), ptr::null_mut()) };
            if n >= 0 {
                return NetFd::new(n);
            }
            match io::Error::last_os_error() {
                err if err.kind() == io::ErrorKind::Interrupted => continue,
                // The peer gave up while queued; just take the next one.
                err if err.kind() == io::ErrorKind::ConnectionAborted => continue,
                err if err.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_readable(timeout)?;
                }
                err => return Err(err.into()),
            }
        }
    }
}

impl Drop for NetFd {
    fn drop(&mut self) {
        // Safety: fd is owned; best-effort close on the drop path
        unsafe { libc::close(self.fd) };
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: all-zero is a valid sockaddr_storage
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            // Safety: sockaddr_in fits at the front of sockaddr_storage
            unsafe { (&raw mut storage).cast::<libc::sockaddr_in>().write(sin) };
            size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            // Safety: sockaddr_in6 fits at the front of sockaddr_storage
            unsafe { (&raw mut storage).cast::<libc::sockaddr_in6>().write(sin6) };
            size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}
