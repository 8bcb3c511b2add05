// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements deferred procedure calls (DPCs).
//!
//! Interrupt handlers do as little as possible, and queue a [`Dpc`] for
//! the rest of their work. Pending DPCs are run by the dispatcher before
//! it picks the next thread, and by the idle loop after each interrupt.
//!
//! DPCs are kept on a stack, so the most recently queued DPC runs first.
//! Queueing a DPC that is already queued has no effect, and a DPC never
//! runs nested inside itself.

use crate::scheduler::Scheduler;
use crate::work::{DeferredFn, WorkSlot, WorkState};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// A deferred procedure call, owned by the
/// subsystem that queues it.
///
#[derive(Debug)]
pub struct Dpc {
    slot: WorkSlot,
}

impl Dpc {
    pub const fn new() -> Self {
        Dpc {
            slot: WorkSlot::new(),
        }
    }

    /// Returns the DPC's current state. This never
    /// blocks, so it is safe to call from any context.
    ///
    pub fn state(&self) -> WorkState {
        self.slot.state()
    }

    /// Returns whether the DPC is waiting to run.
    ///
    pub fn is_queued(&self) -> bool {
        self.slot.is_queued()
    }
}

impl Default for Dpc {
    fn default() -> Self {
        Self::new()
    }
}

/// The stack of pending DPCs.
///
pub(crate) struct DpcQueue {
    pending: Mutex<Vec<Arc<Dpc>>>,
}

impl DpcQueue {
    pub const fn new() -> Self {
        DpcQueue {
            pending: Mutex::new(Vec::new()),
        }
    }
}

impl Scheduler {
    /// Queues `dpc` to call `proc(scheduler, arg)`.
    ///
    /// This masks interrupts itself, so can be called
    /// from ordinary thread context.
    ///
    pub fn queue_dpc(&self, dpc: &Arc<Dpc>, proc: DeferredFn, arg: usize) {
        self.without_interrupts(|| self.push_dpc(dpc, proc, arg));
    }

    /// Queues `dpc` to call `proc(scheduler, arg)`.
    ///
    /// This must be called with interrupts disabled,
    /// such as from an interrupt handler.
    ///
    pub fn queue_irq_dpc(&self, dpc: &Arc<Dpc>, proc: DeferredFn, arg: usize) {
        debug_assert!(
            !self.machine.interrupts_enabled(),
            "queue_irq_dpc() called with interrupts enabled"
        );

        self.push_dpc(dpc, proc, arg);
    }

    fn push_dpc(&self, dpc: &Arc<Dpc>, proc: DeferredFn, arg: usize) {
        if dpc.slot.enqueue(proc, arg) {
            self.dpcs.pending.lock().push(dpc.clone());
        }
    }

    /// Returns the number of entries on the DPC stack.
    ///
    pub fn pending_dpcs(&self) -> usize {
        self.without_interrupts(|| self.dpcs.pending.lock().len())
    }

    /// Runs pending DPCs until none are left.
    ///
    /// Interrupts are only masked while each DPC is
    /// removed from the stack. Callbacks run with
    /// interrupts enabled.
    ///
    pub fn drain_dpcs(&self) {
        loop {
            let next = self.without_interrupts(|| {
                let dpc = self.dpcs.pending.lock().pop()?;
                let callback = dpc.slot.begin();
                Some((dpc, callback))
            });

            let (dpc, callback) = match next {
                Some(next) => next,
                None => return,
            };

            // Skip entries for a DPC that is already
            // running further up the stack.
            if let Some((proc, arg)) = callback {
                self.machine.enable_interrupts();
                proc(self, arg);
                self.without_interrupts(|| dpc.slot.finish());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;
    use crate::testing::boot;
    use crate::work::WorkState;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static LOG: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    fn record(_scheduler: &Scheduler, arg: usize) {
        LOG.lock().push(arg);
    }

    #[test]
    fn queue_is_idempotent_and_lifo() {
        let (scheduler, _test) = boot();
        let first = Arc::new(Dpc::new());
        let second = Arc::new(Dpc::new());

        scheduler.queue_dpc(&first, record, 1);
        scheduler.queue_dpc(&first, record, 100);
        scheduler.queue_dpc(&second, record, 2);
        assert_eq!(scheduler.pending_dpcs(), 2);
        assert!(first.is_queued());
        assert_eq!(first.state(), WorkState::Queued);

        LOG.lock().clear();
        scheduler.drain_dpcs();
        assert_eq!(*LOG.lock(), [2, 1]);
        assert_eq!(scheduler.pending_dpcs(), 0);
        assert_eq!(first.state(), WorkState::Idle);
        assert_eq!(second.state(), WorkState::Idle);
    }

    #[test]
    fn irq_entry_point() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        fn count(_scheduler: &Scheduler, _arg: usize) {
            RUNS.fetch_add(1, Ordering::SeqCst);
        }

        let (scheduler, test) = boot();
        let dpc = Arc::new(Dpc::new());
        test.machine.disable_interrupts();
        scheduler.queue_irq_dpc(&dpc, count, 0);
        scheduler.queue_irq_dpc(&dpc, count, 0);
        assert_eq!(scheduler.pending_dpcs(), 1);

        // Dispatch runs pending DPCs.
        scheduler.yield_now();
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
        assert!(!dpc.is_queued());
    }

    #[test]
    fn callbacks_run_with_interrupts_enabled() {
        static ENABLED: AtomicUsize = AtomicUsize::new(0);
        fn check(scheduler: &Scheduler, _arg: usize) {
            if scheduler.machine().interrupts_enabled() {
                ENABLED.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (scheduler, test) = boot();
        test.machine.disable_interrupts();
        let dpc = Arc::new(Dpc::new());
        scheduler.queue_dpc(&dpc, check, 0);
        assert!(!test.machine.interrupts_enabled());
        scheduler.drain_dpcs();
        assert_eq!(ENABLED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn never_runs_nested() {
        static DEPTH: AtomicUsize = AtomicUsize::new(0);
        static MAX_DEPTH: AtomicUsize = AtomicUsize::new(0);
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static SELF: spin::Once<Arc<Dpc>> = spin::Once::new();

        fn reentrant(scheduler: &Scheduler, _arg: usize) {
            let depth = DEPTH.fetch_add(1, Ordering::SeqCst) + 1;
            MAX_DEPTH.fetch_max(depth, Ordering::SeqCst);
            if CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
                // Queue ourselves again, then drain the
                // queue from inside the callback, as a
                // nested dispatch would.
                let dpc = SELF.get().unwrap();
                scheduler.queue_dpc(dpc, reentrant, 0);
                assert_eq!(dpc.state(), WorkState::Executing { requeued: true });
                scheduler.drain_dpcs();
                assert_eq!(dpc.state(), WorkState::Executing { requeued: false });
            }

            DEPTH.fetch_sub(1, Ordering::SeqCst);
        }

        let (scheduler, _test) = boot();
        let dpc = SELF.call_once(|| Arc::new(Dpc::new()));
        scheduler.queue_dpc(dpc, reentrant, 0);
        scheduler.drain_dpcs();

        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(MAX_DEPTH.load(Ordering::SeqCst), 1);
        assert_eq!(dpc.state(), WorkState::Idle);
        assert_eq!(scheduler.pending_dpcs(), 0);
    }

    #[test]
    fn requeued_during_callback_runs_again() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static SELF: spin::Once<Arc<Dpc>> = spin::Once::new();

        fn again(scheduler: &Scheduler, _arg: usize) {
            if CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
                scheduler.queue_dpc(SELF.get().unwrap(), again, 0);
            }
        }

        let (scheduler, _test) = boot();
        let dpc = SELF.call_once(|| Arc::new(Dpc::new()));
        scheduler.queue_dpc(dpc, again, 0);
        scheduler.drain_dpcs();

        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
        assert_eq!(dpc.state(), WorkState::Idle);
    }
}
