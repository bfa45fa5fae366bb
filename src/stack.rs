// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Guarded fiber stacks and the free-list pool they are recycled through.
//!
//! Every stack is an anonymous private mapping with one `PROT_NONE` guard
//! page on each side of the usable span, so running off either end faults
//! synchronously instead of corrupting a neighbouring stack. Released
//! stacks keep their mapping and guards and go onto a free list; allocation
//! scans the list first-fit before asking the kernel for a new mapping.
//!
//! With randomization enabled the mapping gains one extra page and the
//! usable span is shifted up by a uniformly random 16-byte-aligned offset
//! below one page, so the absolute stack addresses differ from run to run.

use std::io;
use std::ptr;

use crate::error::Error;
use crate::runtime;

/// Default usable stack size for fibers created without an explicit size.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Minimum usable size of a stack; requests below this are rounded up.
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// A guarded stack. Owns its mapping; dropping unmaps it (the pool never
/// drops, it recycles).
#[derive(Debug)]
pub(crate) struct Stack {
    /// Base address of the whole mapping, including guards.
    base: usize,
    /// Length of the whole mapping.
    map_len: usize,
    /// Lowest usable address.
    bottom: usize,
    /// One past the highest usable address, 16-byte aligned.
    top: usize,
}

// The runtime is single-threaded; stacks never move between threads while
// in use. The marker types only get in the way of storing stacks inside
// the thread-local runtime, so nothing is asserted here.

impl Stack {
    /// Maps a fresh stack with at least `size` usable bytes.
    fn map(size: usize, randomize: bool) -> Result<Self, Error> {
        let page = page_size();
        let size = round_up(size.max(MIN_STACK_SIZE), page);

        // Guard page on each side, plus one page of slack to shift the
        // usable span into when randomizing.
        let slack = if randomize { page } else { 0 };
        let map_len = size + 2 * page + slack;

        // Safety: anonymous mapping, length is page-aligned and non-zero
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_len,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            tracing::warn!(size, "stack mapping failed: {err}");
            return Err(Error::NoMemory);
        }
        let base = base as usize;

        // Construct first so the mapping is released if mprotect fails.
        let offset = if randomize {
            fastrand::usize(0..page / 16) * 16
        } else {
            0
        };
        let stack = Stack {
            base,
            map_len,
            bottom: base + page + offset,
            top: base + page + offset + size,
        };

        // Everything except the leading and trailing page becomes
        // read-write; the guards stay PROT_NONE for the life of the mapping.
        // Safety: range lies within the mapping created above
        let rc = unsafe {
            libc::mprotect(
                (base + page) as *mut libc::c_void,
                size + slack,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            tracing::warn!(size, "stack mprotect failed: {err}");
            return Err(Error::NoMemory);
        }

        debug_assert_eq!(stack.top % crate::arch::STACK_ALIGNMENT, 0);
        Ok(stack)
    }

    /// Highest usable address; handed to the context-switch machinery.
    pub(crate) fn top(&self) -> usize {
        self.top
    }

    #[cfg_attr(not(test), expect(dead_code))]
    pub(crate) fn bottom(&self) -> usize {
        self.bottom
    }

    /// Usable bytes between the guards.
    pub(crate) fn size(&self) -> usize {
        self.top - self.bottom
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // Safety: base/map_len describe the mapping created in `map`
        let rc = unsafe { libc::munmap(self.base as *mut libc::c_void, self.map_len) };
        debug_assert_eq!(rc, 0);
    }
}

/// Free list of released stacks.
#[derive(Debug, Default)]
pub(crate) struct StackPool {
    free: Vec<Stack>,
    pub(crate) randomize: bool,
}

impl StackPool {
    pub(crate) const fn new() -> Self {
        Self {
            free: Vec::new(),
            randomize: false,
        }
    }

    /// First-fit over the free list in insertion order, falling back to a
    /// fresh mapping on a miss.
    pub(crate) fn allocate(&mut self, requested: usize) -> Result<Stack, Error> {
        let needed = round_up(requested.max(MIN_STACK_SIZE), page_size());
        if let Some(pos) = self.free.iter().position(|s| s.size() >= needed) {
            let stack = self.free.remove(pos);
            tracing::trace!(size = stack.size(), "reusing pooled stack");
            return Ok(stack);
        }
        let stack = Stack::map(requested, self.randomize)?;
        tracing::trace!(size = stack.size(), "mapped new stack");
        Ok(stack)
    }

    /// Returns a stack to the free list. The mapping is kept.
    pub(crate) fn release(&mut self, stack: Stack) {
        self.free.push(stack);
    }

    pub(crate) fn len(&self) -> usize {
        self.free.len()
    }
}

/// Enables or disables the randomized stack offset for stacks mapped from
/// now on; pooled stacks keep the layout they were mapped with.
pub fn randomize_stacks(on: bool) -> Result<(), Error> {
    runtime::with(|rt| rt.stacks.randomize = on)
}

pub(crate) fn page_size() -> usize {
    // Safety: sysconf is always safe to call
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    debug_assert!(page.is_power_of_two());
    page
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) & !(to - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry() {
        let page = page_size();
        let stack = Stack::map(DEFAULT_STACK_SIZE, false).unwrap();
        assert_eq!(stack.size(), DEFAULT_STACK_SIZE);
        // Usable span excludes both guard pages.
        assert!(stack.bottom() >= stack.base + page);
        assert!(stack.top() + page <= stack.base + stack.map_len);
        assert_eq!(stack.top() % crate::arch::STACK_ALIGNMENT, 0);

        // The span is really writable.
        // Safety: bottom..top was mprotected read-write
        unsafe {
            ptr::write_volatile(stack.bottom() as *mut u8, 0xaa);
            ptr::write_volatile((stack.top() - 1) as *mut u8, 0xbb);
        }
    }

    #[test]
    fn randomized_offset_stays_aligned() {
        let page = page_size();
        for _ in 0..8 {
            let stack = Stack::map(MIN_STACK_SIZE, true).unwrap();
            let offset = stack.bottom() - (stack.base + page);
            assert!(offset < page);
            assert_eq!(offset % 16, 0);
            assert_eq!(stack.size(), MIN_STACK_SIZE);
        }
    }

    #[test]
    fn pool_reuses_first_fit() {
        let mut pool = StackPool::new();
        let small = pool.allocate(MIN_STACK_SIZE).unwrap();
        let big = pool.allocate(4 * MIN_STACK_SIZE).unwrap();
        let small_top = small.top();
        let big_top = big.top();
        pool.release(small);
        pool.release(big);
        assert_eq!(pool.len(), 2);

        // A small request is served by the first (small) entry.
        let reused = pool.allocate(MIN_STACK_SIZE).unwrap();
        assert_eq!(reused.top(), small_top);
        // A big request skips the remaining small entry... there is none
        // left, so it finds the big stack.
        let reused_big = pool.allocate(2 * MIN_STACK_SIZE).unwrap();
        assert_eq!(reused_big.top(), big_top);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn undersized_requests_are_clamped() {
        let mut pool = StackPool::new();
        let stack = pool.allocate(1).unwrap();
        assert!(stack.size() >= MIN_STACK_SIZE);
    }
}
