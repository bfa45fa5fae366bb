// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fiber-local storage.
//!
//! Keys are process-global (per runtime thread) and capped at a small
//! compile-time constant; every fiber carries one value slot per key.
//! Destructors belong to the key, are shared by all fibers, and run during
//! fiber cleanup, before the fiber stops being current. A value whose key
//! has no destructor is simply dropped, so `Drop` impls work as expected.

use core::any::Any;
use std::rc::Rc;

use crate::error::Error;
use crate::runtime;

/// Number of fiber-local keys a runtime supports.
pub const FLS_KEYS_MAX: usize = 16;

/// Per-key cleanup hook, invoked with the fiber's value at fiber exit.
pub type Destructor = fn(Rc<dyn Any>);

/// A fiber-local storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key(usize);

pub(crate) struct FlsTable {
    dtors: [Option<Destructor>; FLS_KEYS_MAX],
    nkeys: usize,
}

impl FlsTable {
    pub(crate) const fn new() -> Self {
        Self {
            dtors: [None; FLS_KEYS_MAX],
            nkeys: 0,
        }
    }
}

/// Allocates a new key, optionally with a destructor.
///
/// Fails with [`Error::NoMemory`] once all [`FLS_KEYS_MAX`] keys exist.
pub fn key_create(dtor: Option<Destructor>) -> Result<Key, Error> {
    runtime::with(|rt| -> Result<Key, Error> {
        if rt.fls.nkeys >= FLS_KEYS_MAX {
            return Err(Error::NoMemory);
        }
        let key = Key(rt.fls.nkeys);
        rt.fls.dtors[rt.fls.nkeys] = dtor;
        rt.fls.nkeys += 1;
        Ok(key)
    })?
}

/// The compile-time key limit.
pub fn key_limit() -> usize {
    FLS_KEYS_MAX
}

/// Stores `value` in the calling fiber's slot for `key`; `None` clears the
/// slot (without running the destructor).
pub fn set(key: Key, value: Option<Rc<dyn Any>>) -> Result<(), Error> {
    runtime::with(|rt| -> Result<(), Error> {
        if key.0 >= rt.fls.nkeys {
            return Err(Error::InvalidArg);
        }
        let me = rt.current.expect("fls access outside a fiber");
        rt.fibers.fiber_mut(me).fls[key.0] = value;
        Ok(())
    })?
}

/// The calling fiber's value for `key`.
pub fn get(key: Key) -> Result<Option<Rc<dyn Any>>, Error> {
    runtime::with(|rt| -> Result<Option<Rc<dyn Any>>, Error> {
        if key.0 >= rt.fls.nkeys {
            return Err(Error::InvalidArg);
        }
        let me = rt.current.expect("fls access outside a fiber");
        Ok(rt.fibers.fiber(me).fls[key.0].clone())
    })?
}

/// Runs the exiting fiber's destructors.
///
/// Values are detached under the runtime borrow, but the destructors are
/// user code and run outside it, so they may use the runtime (though they
/// must not park).
pub(crate) fn run_destructors() {
    let mut work: Vec<(Option<Destructor>, Rc<dyn Any>)> = Vec::new();
    let _ = runtime::with(|rt| {
        let me = rt.current.expect("fls cleanup outside a fiber");
        let fiber = rt.fibers.fiber_mut(me);
        for (slot, dtor) in fiber.fls.iter_mut().zip(rt.fls.dtors.iter()) {
            if let Some(value) = slot.take() {
                work.push((*dtor, value));
            }
        }
    });
    for (dtor, value) in work {
        match dtor {
            Some(dtor) => dtor(value),
            None => drop(value),
        }
    }
}
