// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Abstracts the CPU operations the scheduler depends on.
//!
//! The scheduler never touches the hardware directly. Instead, it calls
//! a [`Machine`], which masks interrupts, halts the CPU, swaps kernel
//! stacks, and manages the lazily switched FPU state. On bare metal
//! x86-64, [`X86Machine`] is the implementation.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x86;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use self::x86::X86Machine;

use crate::thread::ThreadEntry;
use x86_64::VirtAddr;

/// The number of bytes needed to save the FPU and
/// SSE state with FXSAVE.
///
pub const FPU_STATE_SIZE: usize = 512;

/// Holds a thread's saved FPU and SSE state.
///
#[repr(C, align(16))]
pub struct FpuState(pub [u8; FPU_STATE_SIZE]);

impl FpuState {
    /// Returns an empty FPU state.
    ///
    pub const fn new() -> Self {
        FpuState([0u8; FPU_STATE_SIZE])
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Describes the CPU operations used by the scheduler.
///
pub trait Machine: Send + Sync {
    /// Returns whether interrupts are currently enabled.
    ///
    fn interrupts_enabled(&self) -> bool;

    /// Enables interrupts.
    ///
    fn enable_interrupts(&self);

    /// Disables interrupts.
    ///
    fn disable_interrupts(&self);

    /// Enables interrupts and halts the CPU until the
    /// next interrupt arrives.
    ///
    fn wait_for_interrupt(&self);

    /// Prepares a new kernel stack so that the first
    /// switch to it calls `entry(scheduler, arg)` and
    /// returns the initial stack pointer.
    ///
    /// # Safety
    ///
    /// `top` must be the top of a writable stack with
    /// room for the initial frame.
    ///
    unsafe fn prepare_stack(&self, top: VirtAddr, entry: ThreadEntry, arg: usize) -> u64;

    /// Saves the current execution context, storing its
    /// stack pointer into `current`, then resumes the
    /// context whose stack pointer is stored at `new`.
    ///
    /// `switch_stack` returns when the saved context is
    /// switched back to.
    ///
    /// # Safety
    ///
    /// Both pointers must be valid, and `new` must hold
    /// a stack pointer saved by `switch_stack` or returned
    /// by [`prepare_stack`](Machine::prepare_stack).
    ///
    unsafe fn switch_stack(&self, current: *mut u64, new: *const u64);

    /// Sets the stack used when an interrupt arrives
    /// while running in user mode.
    ///
    fn set_kernel_stack(&self, top: VirtAddr);

    /// Points the thread-local storage register at the
    /// given thread information block.
    ///
    fn install_tls(&self, tib: VirtAddr);

    /// Saves the FPU state into `state`.
    ///
    fn fpu_save(&self, state: &mut FpuState);

    /// Restores the FPU state from `state`, or resets
    /// the FPU if `state` is `None`.
    ///
    fn fpu_restore(&self, state: Option<&FpuState>);

    /// Sets whether the next FPU instruction traps.
    ///
    fn set_fpu_trap(&self, armed: bool);

    /// Drops into user mode, starting at `entry` with
    /// the given user stack and the thread information
    /// block as the first argument.
    ///
    /// # Safety
    ///
    /// The stack and thread information block must be
    /// mapped into user space.
    ///
    unsafe fn enter_user_mode(&self, entry: VirtAddr, stack_top: VirtAddr, tib: VirtAddr) -> !;
}

impl dyn Machine {
    /// Runs `f` with interrupts disabled, restoring
    /// the previous interrupt state afterwards.
    ///
    pub fn without_interrupts<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let restart_interrupts = self.interrupts_enabled();
        if restart_interrupts {
            self.disable_interrupts();
        }

        let ret = f();

        if restart_interrupts {
            self.enable_interrupts();
        }

        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::DebugMachine;
    use alloc::sync::Arc;

    #[test]
    fn without_interrupts() {
        let machine: Arc<dyn Machine> = Arc::new(DebugMachine::new());
        machine.enable_interrupts();
        let inside = machine.without_interrupts(|| machine.interrupts_enabled());
        assert!(!inside);
        assert!(machine.interrupts_enabled());

        // Nested sections leave interrupts disabled.
        machine.disable_interrupts();
        machine.without_interrupts(|| {
            machine.without_interrupts(|| {});
            assert!(!machine.interrupts_enabled());
        });
        assert!(!machine.interrupts_enabled());
    }

    #[test]
    fn fpu_state_alignment() {
        assert_eq!(core::mem::align_of::<FpuState>(), 16);
        assert_eq!(core::mem::size_of::<FpuState>(), FPU_STATE_SIZE);
    }
}
