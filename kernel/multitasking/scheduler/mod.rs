// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements a strict priority scheduler for threads.
//!
//! ## Initialisation
//!
//! The scheduler will not take over the flow of execution until the
//! kernel's initial thread calls [`Scheduler::start`]. Until then, the
//! initial thread is the idle thread and keeps running. Threads created
//! before `start` wait in the ready queues.
//!
//! ## Thread switching
//!
//! [`Scheduler::dispatch`] runs any pending DPCs, then switches to the
//! thread at the head of the highest non-empty priority level. Threads at
//! the same priority run in the order they were made ready.
//! [`Scheduler::yield_now`] puts the current thread at the back of its
//! level before dispatching. [`Scheduler::preempt`] is called at the exit
//! of the clock interrupt and yields if a reschedule was requested.
//!
//! ## FPU state
//!
//! The FPU is switched lazily. Every switch arms the FPU trap, and the
//! first FPU instruction a thread executes afterwards traps into
//! [`Scheduler::handle_fpu_trap`], which restores the thread's state.
//! A thread's FPU state is only saved when it is switched out after
//! having used the FPU.

mod idle;
mod ready;

use self::ready::ReadyQueues;
use crate::config::Config;
use crate::dpc::DpcQueue;
use crate::error::Error;
use crate::machine::Machine;
use crate::memory::MemoryManager;
use crate::objects::{Debugger, HandleTable, Platform};
use crate::taskqueue::TaskQueue;
use crate::thread::{Thread, ThreadId, ThreadSnapshot, ThreadState};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use log::trace;
use spin::{Mutex, Once};
use x86_64::VirtAddr;

/// Scheduler owns every thread and decides which one runs.
///
pub struct Scheduler {
    pub(crate) config: Config,
    pub(crate) machine: Arc<dyn Machine>,
    pub(crate) memory: Arc<dyn MemoryManager>,
    pub(crate) handles: Arc<dyn HandleTable>,
    pub(crate) debugger: Arc<dyn Debugger>,

    // Every living thread, including the idle thread.
    // Threads are removed once they have been
    // reclaimed.
    pub(crate) threads: Mutex<BTreeMap<ThreadId, Arc<Thread>>>,

    pub(crate) ready: Mutex<ReadyQueues>,
    pub(crate) current: Mutex<Arc<Thread>>,
    pub(crate) idle: Arc<Thread>,

    // Set when a thread becomes ready, or by the
    // clock, and cleared by dispatch.
    pub(crate) resched: AtomicBool,

    // Set while the idle thread is halted.
    pub(crate) idling: AtomicBool,

    pub(crate) dpcs: DpcQueue,
    pub(crate) system_tasks: Once<Arc<TaskQueue>>,
    pub(crate) next_id: AtomicU64,
}

impl Scheduler {
    /// Creates a scheduler. The calling thread becomes
    /// the idle thread.
    ///
    /// This also creates the system task queue, whose
    /// worker thread is left ready to run.
    ///
    pub fn new(platform: Platform, config: Config) -> Result<Self, Error> {
        let idle = Arc::new(Thread::new_idle_thread());
        let mut threads = BTreeMap::new();
        threads.insert(ThreadId::IDLE, idle.clone());

        let scheduler = Scheduler {
            config,
            machine: platform.machine,
            memory: platform.memory,
            handles: platform.handles,
            debugger: platform.debugger,
            threads: Mutex::new(threads),
            ready: Mutex::new(ReadyQueues::new()),
            current: Mutex::new(idle.clone()),
            idle,
            resched: AtomicBool::new(false),
            idling: AtomicBool::new(false),
            dpcs: DpcQueue::new(),
            system_tasks: Once::new(),
            next_id: AtomicU64::new(1),
        };

        let system_tasks =
            scheduler.create_task_queue(config.system_task_priority, None, "systask")?;
        scheduler.system_tasks.call_once(|| system_tasks);

        Ok(scheduler)
    }

    /// Runs `f` with interrupts disabled.
    ///
    pub(crate) fn without_interrupts<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        self.machine.without_interrupts(f)
    }

    /// Returns the scheduler's configuration.
    ///
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the machine the scheduler runs on.
    ///
    pub fn machine(&self) -> &dyn Machine {
        &*self.machine
    }

    /// Returns a copy of the currently executing thread.
    ///
    pub fn current_thread(&self) -> Arc<Thread> {
        self.without_interrupts(|| self.current.lock().clone())
    }

    /// Returns whether `thread` is the currently executing
    /// thread.
    ///
    pub fn is_current(&self, thread: &Thread) -> bool {
        self.without_interrupts(|| core::ptr::eq(&**self.current.lock(), thread))
    }

    /// Returns the idle thread.
    ///
    pub fn idle_thread(&self) -> &Arc<Thread> {
        &self.idle
    }

    /// Returns the thread with the given id, if it
    /// exists and has not yet been reclaimed.
    ///
    pub fn get_thread(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.without_interrupts(|| self.threads.lock().get(&id).cloned())
    }

    /// Returns the number of threads that have not yet
    /// been reclaimed.
    ///
    pub fn thread_count(&self) -> usize {
        self.without_interrupts(|| self.threads.lock().len())
    }

    /// Returns a snapshot of every thread, in thread
    /// id order.
    ///
    pub fn threads(&self) -> Vec<ThreadSnapshot> {
        let threads: Vec<Arc<Thread>> =
            self.without_interrupts(|| self.threads.lock().values().cloned().collect());

        threads
            .iter()
            .map(|thread| thread.snapshot(&*self.handles))
            .collect()
    }

    /// Returns the number of threads in the ready
    /// queues.
    ///
    pub fn ready_count(&self) -> usize {
        self.without_interrupts(|| self.ready.lock().len())
    }

    /// Returns the system task queue.
    ///
    /// # Panics
    ///
    /// `system_tasks` will panic if called while the
    /// scheduler is still being created.
    ///
    pub fn system_tasks(&self) -> &Arc<TaskQueue> {
        match self.system_tasks.get() {
            Some(queue) => queue,
            None => panic!("system task queue used before it was created"),
        }
    }

    /// Asks the scheduler to reconsider which thread
    /// should run at the next opportunity.
    ///
    /// This is called by the clock interrupt.
    ///
    pub fn request_reschedule(&self) {
        self.resched.store(true, Ordering::Release);
    }

    /// Returns whether a reschedule has been requested.
    ///
    pub fn reschedule_requested(&self) -> bool {
        self.resched.load(Ordering::Acquire)
    }

    /// Hands control over to the scheduler.
    ///
    /// This lets the idle thread take control of the kernel's
    /// initial state and lets the scheduler take ownership of
    /// the flow of execution.
    ///
    /// # Panics
    ///
    /// `start` will panic if not called by the idle
    /// thread.
    ///
    pub fn start(&self) -> ! {
        if !self.current_thread().is_idle() {
            panic!("Scheduler::start() called by a thread other than the idle thread");
        }

        // Hand over to the scheduler.
        self.yield_now();

        // We're now executing as the idle thread.
        self.idle_loop();
    }

    /// Puts the current thread at the back of its
    /// priority level and switches to the best ready
    /// thread.
    ///
    /// If the current thread is still the best choice,
    /// `yield_now` returns without switching.
    ///
    pub fn yield_now(&self) {
        let current = self.current_thread();
        self.mark_ready(&current);

        // Drop our reference to the current thread,
        // so the scheduler has full control.
        drop(current);

        self.dispatch();
    }

    /// Yields the current thread if a reschedule has
    /// been requested.
    ///
    /// This should be called when returning from an
    /// interrupt handler.
    ///
    pub fn preempt(&self) {
        if !self.reschedule_requested() {
            return;
        }

        // A thread that is blocking or exiting will
        // dispatch on its own.
        if self.current_thread().state() != ThreadState::Running {
            return;
        }

        self.yield_now();
    }

    /// Selects the next thread to run and switches to
    /// it.
    ///
    /// The reschedule flag is cleared and any pending
    /// DPCs are run first. The current thread must
    /// already be in the ready queues, or have set its
    /// state to blocked or terminated.
    ///
    /// `dispatch` returns once the current thread is
    /// selected again.
    ///
    /// # Panics
    ///
    /// `dispatch` will panic if no thread is ready to run,
    /// which can only happen if the idle thread has been
    /// removed from the ready queues.
    ///
    pub fn dispatch(&self) {
        let restart_interrupts = self.machine.interrupts_enabled();

        self.resched.store(false, Ordering::Release);
        self.drain_dpcs();

        self.machine.disable_interrupts();
        let current = self.current_thread();
        let next = self.select_next();

        if Arc::ptr_eq(&current, &next) {
            // We're already running the right
            // thread, so return without doing
            // anything further.
            current.set_state(ThreadState::Running);
            if restart_interrupts {
                self.machine.enable_interrupts();
            }

            return;
        }

        // Save the FPU state if the outgoing thread has
        // used the FPU since it was switched in.
        if current.set_fpu_used(false) {
            current.save_fpu_state(&*self.machine);
        }

        if let Some(top) = next.kernel_stack_top() {
            self.machine.set_kernel_stack(top);
        }

        trace!("switching from thread {} to thread {}", current.id(), next.id());

        // Retrieve a pointer to each stack pointer. These point
        // to the value in the Thread structure, where we keep a
        // copy of the current stack pointer. Both threads stay
        // in the thread table, so the pointers outlive the
        // switch.
        let current_stack_pointer = current.stack_pointer();
        let new_stack_pointer = next.stack_pointer();
        *self.current.lock() = next;

        // We drop our reference to the current thread now,
        // as an exiting thread never returns from the switch.
        drop(current);

        unsafe { self.machine.switch_stack(current_stack_pointer, new_stack_pointer) };

        // We're now executing as the resumed thread.
        self.resumed();

        if restart_interrupts {
            self.machine.enable_interrupts();
        }
    }

    /// Removes threads from the ready queues until one
    /// that is not suspended is found.
    ///
    /// Suspended threads are dropped from the ready
    /// queues, and are only made ready again when
    /// they are resumed. Threads that terminated while
    /// still queued are dropped too.
    ///
    fn select_next(&self) -> Arc<Thread> {
        let mut ready = self.ready.lock();
        loop {
            let thread = match ready.pop_highest() {
                Some(thread) => thread,
                None => panic!("no thread ready to run"),
            };

            thread.set_enqueued(false);
            if thread.state() == ThreadState::Terminated {
                trace!("discarding terminated thread {}", thread.id());
                continue;
            }

            if thread.is_suspended() {
                trace!("discarding suspended thread {}", thread.id());
                continue;
            }

            return thread;
        }
    }

    /// Restores the current thread's per-thread CPU
    /// state after a switch.
    ///
    fn resumed(&self) {
        let current = self.current_thread();
        current.set_state(ThreadState::Running);
        self.machine
            .install_tls(current.tib().unwrap_or_else(VirtAddr::zero));
        self.machine.set_fpu_trap(true);
    }

    /// Called by a new thread the first time it runs,
    /// before its entry point.
    ///
    pub(crate) fn thread_started(&self) {
        self.resumed();
        self.machine.enable_interrupts();
    }

    /// Handles the trap raised by the first FPU
    /// instruction after a switch.
    ///
    /// The current thread's saved FPU state is restored,
    /// or the FPU is reset if the thread has never used
    /// it.
    ///
    pub fn handle_fpu_trap(&self) {
        self.without_interrupts(|| {
            self.machine.set_fpu_trap(false);
            let current = self.current_thread();
            current.restore_fpu_state(&*self.machine);
            current.set_fpu_used(true);
        });
    }
}
