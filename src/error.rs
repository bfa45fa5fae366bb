// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use std::io;

/// Error values returned by runtime operations.
///
/// Errors are plain values and are never thrown across a context switch;
/// every parking primitive reports the first of interrupt, timeout, backend
/// error, or success.
#[derive(Debug)]
pub enum Error {
    /// A handle was stale, a key was out of range, or an argument was
    /// otherwise malformed.
    InvalidArg,
    /// The resource still has users (waiters on a condition variable,
    /// registered interest on a file descriptor).
    Busy,
    /// The caller does not own the resource it tried to release.
    Perm,
    /// Acquiring the resource would deadlock the calling fiber.
    Deadlock,
    /// The fiber was interrupted while parked, or had a pending interrupt
    /// when it tried to park.
    Interrupted,
    /// The wait deadline elapsed before the condition was signalled.
    TimedOut,
    /// The event backend or another syscall failed.
    Io(io::Error),
    /// A stack or runtime record could not be allocated.
    NoMemory,
}

impl Error {
    /// Returns `true` if this error is [`Error::Interrupted`].
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }

    /// Returns `true` if this error is [`Error::TimedOut`].
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Error::TimedOut)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArg => f.write_str("invalid argument or stale handle"),
            Error::Busy => f.write_str("resource is busy"),
            Error::Perm => f.write_str("caller does not own the resource"),
            Error::Deadlock => f.write_str("operation would deadlock"),
            Error::Interrupted => f.write_str("fiber was interrupted"),
            Error::TimedOut => f.write_str("wait timed out"),
            Error::Io(err) => write!(f, "event backend error: {err}"),
            Error::NoMemory => f.write_str("memory allocation failed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::OutOfMemory => Error::NoMemory,
            io::ErrorKind::Interrupted => Error::Interrupted,
            _ => Error::Io(err),
        }
    }
}
