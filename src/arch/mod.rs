// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Machine-level context switching.
//!
//! A context is nothing but a stack pointer: suspending saves the
//! callee-saved register file onto the suspending stack and records the
//! resulting stack pointer; resuming installs a previously recorded stack
//! pointer and pops the register file back. The switch routine never touches
//! the source stack after the jump, so the source stack may be handed to the
//! free list by the very code that is about to switch away from it.
//!
//! [`init_stack`] seeds a fresh stack with a synthetic register frame whose
//! return slot points at an entry trampoline, so the first switch into the
//! context "returns" into it.

use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub(crate) use x86_64::{init_stack, switch};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub(crate) use aarch64::{init_stack, switch};
    } else {
        compile_error!("unsupported target architecture");
    }
}

/// Alignment required of a stack top handed to [`init_stack`].
pub(crate) const STACK_ALIGNMENT: usize = 16;
