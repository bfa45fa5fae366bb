// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::arch::global_asm;

use super::STACK_ALIGNMENT;

// Symmetric stack switch for the SysV ABI.
//
// Because this is an ordinary `extern "C"` call, the compiler already
// treats every caller-saved register as clobbered; the routine only has to
// preserve the callee-saved set (RBP, RBX, R12-R15) itself. It pushes those
// six registers, publishes the resulting stack pointer through the first
// argument, installs the target stack pointer, and pops the frame the
// target context pushed when *it* suspended. The final RET consumes the
// target's return slot, which is either the address inside a previous
// `strand_switch_stacks` call or the entry trampoline seeded by
// `init_stack`.
//
// Note: incompatible with CET shadow stacks; the runtime switches RSP
// behind the kernel's back.
global_asm! {
    ".balign 16",
    ".globl strand_switch_stacks",
    "strand_switch_stacks:",
    // Save the callee-saved register file on the outgoing stack.
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    // Publish the suspended stack pointer, then leave this stack for good.
    "mov [rdi], rsp",
    "mov rsp, rsi",
    // Restore the register file the incoming context saved (mirror order).
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
}

unsafe extern "C" {
    fn strand_switch_stacks(save: *mut usize, target: usize);
}

/// Suspends the current context into `*save` and resumes the context
/// recorded at `target`.
///
/// # Safety
///
/// `target` must be a stack pointer produced by [`init_stack`] or by a
/// previous switch out of a live context, and the stack it points into must
/// still be mapped. No Rust reference to runtime state may be held across
/// the call.
#[inline]
pub(crate) unsafe fn switch(save: *mut usize, target: usize) {
    // Safety: ensured by caller
    unsafe { strand_switch_stacks(save, target) }
}

/// Writes the initial frame for a fresh context onto `top` and returns the
/// stack pointer to resume it with.
///
/// The frame mimics what `strand_switch_stacks` pushes when suspending:
/// six zeroed register slots and a return slot holding `entry`. Above the
/// return slot sits a null word, so `entry` starts with a null return
/// address (terminating frame-pointer walks) and with the stack misaligned
/// by one word exactly as the ABI prescribes at function entry.
///
/// # Safety
///
/// `top` must be the 16-byte-aligned upper end of a writable region with
/// space for the eight-word frame.
pub(crate) unsafe fn init_stack(top: usize, entry: extern "C" fn() -> !) -> usize {
    debug_assert_eq!(top % STACK_ALIGNMENT, 0);

    // Safety: ensured by caller
    unsafe {
        let mut sp = top;
        push(&mut sp, 0);
        push(&mut sp, entry as usize);
        // RBP, RBX, R12-R15.
        for _ in 0..6 {
            push(&mut sp, 0);
        }
        sp
    }
}

#[inline]
unsafe fn push(sp: &mut usize, val: usize) {
    // Safety: ensured by caller
    unsafe {
        *sp -= size_of::<usize>();
        *(*sp as *mut usize) = val;
    }
}
