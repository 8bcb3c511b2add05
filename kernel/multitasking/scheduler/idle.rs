// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the idle thread.
//!
//! We fall back to this if the kernel has no other work left to do.

use super::Scheduler;
use core::sync::atomic::Ordering;

impl Scheduler {
    /// Runs the idle loop forever.
    ///
    /// Each iteration halts until the next interrupt.
    /// If the interrupt requested a reschedule, the idle
    /// thread yields so the best ready thread can run.
    /// Otherwise, only the pending DPCs are run.
    ///
    pub fn idle_loop(&self) -> ! {
        loop {
            self.idle_step();
        }
    }

    /// Performs one iteration of the idle loop.
    ///
    pub(crate) fn idle_step(&self) {
        self.idling.store(true, Ordering::Release);
        self.machine.wait_for_interrupt();
        self.idling.store(false, Ordering::Release);

        if self.reschedule_requested() {
            self.yield_now();
        } else {
            self.drain_dpcs();
        }
    }

    /// Returns whether the CPU is halted in the idle
    /// loop.
    ///
    /// Interrupt handlers can use this to tell whether
    /// they interrupted the idle thread.
    ///
    pub fn is_idle(&self) -> bool {
        self.idling.load(Ordering::Acquire)
    }
}
