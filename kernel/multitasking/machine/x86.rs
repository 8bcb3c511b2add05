// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements [`Machine`] for bare metal x86-64.

use super::{FpuState, Machine};
use crate::switch::{self, seed_stack};
use crate::thread::ThreadEntry;
use core::arch::asm;
use spin::Mutex;
use x86_64::instructions::interrupts;
use x86_64::registers::control::{Cr0, Cr0Flags};
use x86_64::registers::model_specific::FsBase;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// The RFLAGS used when entering user mode, with
/// interrupts enabled and the reserved bit 1 set.
///
const USER_RFLAGS: u64 = 0x202;

/// Drives a single x86-64 CPU.
///
pub struct X86Machine {
    // The task state segment, whose first privilege
    // stack is used for interrupts from user mode.
    tss: Mutex<&'static mut TaskStateSegment>,

    // The segment selectors for user code and data,
    // including the requested privilege level.
    user_code: SegmentSelector,
    user_data: SegmentSelector,
}

impl X86Machine {
    /// Returns a machine that uses the given task
    /// state segment and user segment selectors.
    ///
    pub fn new(
        tss: &'static mut TaskStateSegment,
        user_code: SegmentSelector,
        user_data: SegmentSelector,
    ) -> Self {
        X86Machine {
            tss: Mutex::new(tss),
            user_code,
            user_data,
        }
    }
}

impl Machine for X86Machine {
    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    fn enable_interrupts(&self) {
        interrupts::enable();
    }

    fn disable_interrupts(&self) {
        interrupts::disable();
    }

    fn wait_for_interrupt(&self) {
        interrupts::enable_and_hlt();
    }

    unsafe fn prepare_stack(&self, top: VirtAddr, entry: ThreadEntry, arg: usize) -> u64 {
        seed_stack(
            top,
            switch::start_kernel_thread_address(),
            entry as usize as u64,
            arg as u64,
        )
    }

    unsafe fn switch_stack(&self, current: *mut u64, new: *const u64) {
        switch::switch_stack(current, new);
    }

    fn set_kernel_stack(&self, top: VirtAddr) {
        self.tss.lock().privilege_stack_table[0] = top;
    }

    fn install_tls(&self, tib: VirtAddr) {
        #[allow(unused_unsafe)]
        unsafe {
            FsBase::write(tib);
        }
    }

    fn fpu_save(&self, state: &mut FpuState) {
        unsafe {
            asm!("fxsave [{}]", in(reg) state.0.as_mut_ptr(), options(nostack, preserves_flags));
        }
    }

    fn fpu_restore(&self, state: Option<&FpuState>) {
        match state {
            Some(state) => unsafe {
                asm!("fxrstor [{}]", in(reg) state.0.as_ptr(), options(nostack, preserves_flags, readonly));
            },
            None => unsafe {
                asm!("fninit", options(nomem, nostack, preserves_flags));
            },
        }
    }

    fn set_fpu_trap(&self, armed: bool) {
        if armed {
            unsafe { Cr0::update(|flags| flags.insert(Cr0Flags::TASK_SWITCHED)) };
        } else {
            unsafe { asm!("clts", options(nomem, nostack, preserves_flags)) };
        }
    }

    unsafe fn enter_user_mode(&self, entry: VirtAddr, stack_top: VirtAddr, tib: VirtAddr) -> ! {
        // Leave a null return address below the stack
        // top, so the entry point sees a normal call
        // frame.
        let stack: *mut u64 = (stack_top - 8u64).as_mut_ptr();
        stack.write(0);

        asm!(
            "push {ss}",
            "push {stack}",
            "push {rflags}",
            "push {cs}",
            "push {rip}",
            "iretq",
            ss = in(reg) u64::from(self.user_data.0),
            stack = in(reg) stack as u64,
            rflags = in(reg) USER_RFLAGS,
            cs = in(reg) u64::from(self.user_code.0),
            rip = in(reg) entry.as_u64(),
            in("rdi") tib.as_u64(),
            options(noreturn),
        );
    }
}
