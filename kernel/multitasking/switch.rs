// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! switch contains the functionality to switch between threads.
//!
//! A thread's saved context lives on its own kernel stack. Switching
//! pushes the callee-saved registers and RFLAGS onto the outgoing stack,
//! saves the stack pointer into the outgoing thread, loads the incoming
//! thread's stack pointer, and pops the same registers back off.
//!
//! New threads are given a synthetic frame by [`seed_stack`], so the
//! first switch into them "returns" into the thread start trampoline.

use x86_64::VirtAddr;

/// DEFAULT_RFLAGS contains the reserved bits of the
/// RFLAGS register so we can include them when we
/// build a new thread's initial stack.
///
/// Bit 1 is always set, as described in Figure 3-8
/// on page 78 of volume 1 of the Intel 64 manual.
/// Interrupts start disabled and are enabled once
/// the new thread is marked running.
///
pub(crate) const DEFAULT_RFLAGS: u64 = 0x2;

/// The number of callee-saved registers restored
/// by `switch_stack`: rbp, rbx, r12, r13, r14, and
/// r15.
///
pub(crate) const SAVED_REGISTERS: usize = 6;

/// push_stack is used to build a new thread's stack
/// without having to drop down to assembly. This is
/// done by dynamically populating the stack, value
/// by value. These are then popped off in switch_stack
/// when switching to the new thread for the first
/// time.
///
unsafe fn push_stack(mut rsp: *mut u64, value: u64) -> *mut u64 {
    // We move the stack pointer down by 8 bytes, write
    // the value to the new space, then return the updated
    // stack pointer.
    rsp = rsp.sub(1);
    rsp.write(value);
    rsp
}

/// Builds the initial frame for a new thread on the
/// stack whose top is `top`, returning the stack
/// pointer to save in the thread.
///
/// The first switch to the thread pops the zeroed
/// registers and RFLAGS, then returns into
/// `trampoline`, which finds `entry` and `arg` on the
/// stack.
///
/// # Safety
///
/// `top` must be the 16-byte aligned top of a writable
/// stack with at least 80 bytes of space.
///
pub(crate) unsafe fn seed_stack(top: VirtAddr, trampoline: u64, entry: u64, arg: u64) -> u64 {
    let mut rsp: *mut u64 = top.as_mut_ptr();
    rsp = push_stack(rsp, arg);
    rsp = push_stack(rsp, entry);
    rsp = push_stack(rsp, trampoline);
    for _ in 0..SAVED_REGISTERS {
        rsp = push_stack(rsp, 0);
    }

    rsp = push_stack(rsp, DEFAULT_RFLAGS);
    rsp as u64
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub(crate) use self::asm::{start_kernel_thread_address, switch_stack};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod asm {
    use crate::thread::ThreadEntry;
    use core::arch::global_asm;

    global_asm!(
        ".global multitasking_switch_stack",
        "multitasking_switch_stack:",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "pushfq",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "popfq",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
        "",
        ".global multitasking_start_kernel_thread",
        "multitasking_start_kernel_thread:",
        "pop rdi",
        "pop rsi",
        "call {thread_start}",
        "ud2",
        thread_start = sym thread_start,
    );

    extern "sysv64" {
        /// Saves the callee-saved registers on the current
        /// stack, stores the stack pointer through the
        /// first argument, then loads the stack pointer
        /// from the second argument and restores its
        /// registers.
        ///
        fn multitasking_switch_stack(current_stack_pointer: *mut u64, new_stack_pointer: *const u64);

        /// Pops a new thread's entry point and argument
        /// from the stack and passes them to `thread_start`.
        ///
        /// Its address is placed on each new thread's stack
        /// by [`seed_stack`](super::seed_stack).
        ///
        fn multitasking_start_kernel_thread() -> !;
    }

    /// Switches from the current kernel stack to another.
    ///
    /// # Safety
    ///
    /// See [`Machine::switch_stack`](crate::machine::Machine::switch_stack).
    ///
    pub(crate) unsafe fn switch_stack(current: *mut u64, new: *const u64) {
        multitasking_switch_stack(current, new);
    }

    /// Returns the address of the thread start
    /// trampoline.
    ///
    pub(crate) fn start_kernel_thread_address() -> u64 {
        multitasking_start_kernel_thread as usize as u64
    }

    /// The first Rust code run by every new thread.
    ///
    extern "sysv64" fn thread_start(entry: u64, arg: u64) -> ! {
        let scheduler = crate::scheduler();
        scheduler.thread_started();

        let entry: ThreadEntry = unsafe { core::mem::transmute(entry as usize) };
        entry(scheduler, arg as usize);

        scheduler.terminate(0);
    }
}
