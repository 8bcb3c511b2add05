// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Creates, readies, suspends, and terminates threads.

use crate::error::Error;
use crate::scheduler::Scheduler;
use crate::thread::{KernelStack, Priority, Thread, ThreadEntry, ThreadId, ThreadState, UserContext};
use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use log::{debug, error, warn};
use x86_64::VirtAddr;

impl Scheduler {
    /// Allocates the next thread id.
    ///
    fn next_thread_id(&self) -> ThreadId {
        ThreadId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Builds a thread record with a fresh kernel stack,
    /// prepared so the thread starts in `entry(arg)`.
    ///
    fn new_thread(
        &self,
        entry: ThreadEntry,
        arg: usize,
        priority: Priority,
        name: &'static str,
        entry_point: usize,
    ) -> Result<Arc<Thread>, Error> {
        let stack = KernelStack::allocate(&*self.memory, self.config.kernel_stack_pages)?;
        let stack_pointer = unsafe { self.machine.prepare_stack(stack.top(), entry, arg) };
        let id = self.next_thread_id();

        Ok(Arc::new(Thread::new(
            id,
            name,
            priority,
            entry_point,
            Some(stack),
            stack_pointer,
        )))
    }

    /// Adds the thread to the set of all threads.
    ///
    fn link(&self, thread: &Arc<Thread>) {
        self.without_interrupts(|| self.threads.lock().insert(thread.id(), thread.clone()));
    }

    /// Releases the resources of a thread that was
    /// never linked.
    ///
    fn discard(&self, thread: &Thread) {
        if let Some(handle) = thread.set_handle(None) {
            self.handles.release(handle);
        }

        if let Some(user) = self.without_interrupts(|| thread.take_user_context()) {
            user.release(&*self.memory);
        }

        if let Some(stack) = self.without_interrupts(|| thread.take_kernel_stack()) {
            unsafe { stack.release(&*self.memory) };
        }
    }

    /// Creates a new kernel thread, which starts by calling
    /// `entry(scheduler, arg)`.
    ///
    /// The thread is ready to run immediately. If `entry`
    /// returns, the thread terminates with exit code 0.
    ///
    pub fn create_kernel_thread(
        &self,
        entry: ThreadEntry,
        arg: usize,
        priority: Priority,
        name: &'static str,
    ) -> Result<Arc<Thread>, Error> {
        let thread = self.new_thread(entry, arg, priority, name, entry as usize)?;
        self.link(&thread);
        debug!(
            "created kernel thread {} ({}) at priority {:?}",
            thread.id(),
            name,
            priority
        );

        self.mark_ready(&thread);
        self.debugger.thread_created(&thread, entry as usize);

        Ok(thread)
    }

    /// Creates a new user thread, which starts executing
    /// in user mode at `entry_point`.
    ///
    /// The user stack reserves `stack_size` bytes, rounded
    /// up to whole pages, or the default size if
    /// `stack_size` is zero.
    ///
    /// The thread is created suspended, so it does not run
    /// until [`resume`](Scheduler::resume) is called. If
    /// any allocation fails, everything allocated so far is
    /// released and no thread is created.
    ///
    pub fn create_user_thread(
        &self,
        entry_point: VirtAddr,
        stack_size: usize,
    ) -> Result<Arc<Thread>, Error> {
        let stack_size = self.config.user_stack_size(stack_size);
        let thread = self.new_thread(
            user_thread_start,
            0,
            Priority::Normal,
            "user",
            entry_point.as_u64() as usize,
        )?;
        thread.increment_suspend_count();

        let user = UserContext::allocate(
            &*self.memory,
            thread.id(),
            entry_point,
            stack_size,
            self.config.user_stack_commit,
        );
        match user {
            Ok(user) => self.without_interrupts(|| thread.set_user_context(user)),
            Err(err) => {
                self.discard(&thread);
                return Err(err);
            }
        }

        match self.handles.allocate(&thread) {
            Some(handle) => {
                thread.set_handle(Some(handle));
            }
            None => {
                self.discard(&thread);
                return Err(Error::OutOfMemory);
            }
        }

        self.link(&thread);
        debug!(
            "created user thread {} at {:#x}, with {} byte stack",
            thread.id(),
            entry_point.as_u64(),
            stack_size
        );

        self.debugger.thread_created(&thread, entry_point.as_u64() as usize);

        Ok(thread)
    }

    /// Marks the thread as ready to run, adding it to the
    /// back of its priority level, and requests a
    /// reschedule.
    ///
    /// A thread that is already in the ready queues is
    /// not added a second time. Terminated threads are
    /// ignored.
    ///
    pub fn mark_ready(&self, thread: &Arc<Thread>) {
        match thread.state() {
            ThreadState::Terminated => {
                warn!("ignoring attempt to ready terminated thread {}", thread.id());
                return;
            }
            ThreadState::Running if !self.is_current(thread) => {
                warn!("ignoring attempt to ready running thread {}", thread.id());
                return;
            }
            _ => {}
        }

        self.without_interrupts(|| {
            thread.set_state(ThreadState::Ready);
            if !thread.set_enqueued(true) {
                self.ready.lock().push(thread.clone());
            }
        });

        self.request_reschedule();
    }

    /// Suspends the thread, returning its previous
    /// suspend count.
    ///
    /// A suspended thread is not run until it has been
    /// resumed as many times as it was suspended. If it
    /// is currently running, it keeps running until it
    /// next leaves the CPU.
    ///
    /// # Panics
    ///
    /// `suspend` will panic if called on the idle thread,
    /// which must always be able to run.
    ///
    pub fn suspend(&self, thread: &Thread) -> u32 {
        if thread.is_idle() {
            panic!("idle thread cannot be suspended");
        }

        thread.increment_suspend_count()
    }

    /// Resumes the thread, returning its previous suspend
    /// count.
    ///
    /// When the count reaches zero and the thread is
    /// ready or has never run, it is added to the ready
    /// queues. Resuming a thread that is not suspended
    /// has no effect.
    ///
    /// # Panics
    ///
    /// `resume` will panic if called on a terminated
    /// thread.
    ///
    pub fn resume(&self, thread: &Arc<Thread>) -> u32 {
        if thread.state() == ThreadState::Terminated {
            panic!("terminated thread {} resumed", thread.id());
        }

        self.without_interrupts(|| {
            let prev = thread.decrement_suspend_count();
            if prev == 1
                && matches!(
                    thread.state(),
                    ThreadState::Ready | ThreadState::Initialized
                )
            {
                self.mark_ready(thread);
            }

            prev
        })
    }

    /// Blocks the current thread until something calls
    /// [`mark_ready`](Scheduler::mark_ready) on it.
    ///
    /// # Panics
    ///
    /// `block_current` will panic if called by the idle
    /// thread, which must never block.
    ///
    pub fn block_current(&self) {
        let current = self.current_thread();
        if current.is_idle() {
            panic!("idle thread tried to block");
        }

        current.set_state(ThreadState::Waiting);
        drop(current);

        self.dispatch();
    }

    /// Terminates the current thread and switches to
    /// the next runnable thread.
    ///
    /// The thread's handle and user context are released
    /// immediately. Its kernel stack is freed later by the
    /// system task queue.
    ///
    /// # Panics
    ///
    /// `terminate` will panic if called by the idle thread,
    /// which must execute indefinitely to manage the
    /// CPU.
    ///
    pub fn terminate(&self, exit_code: i32) -> ! {
        self.retire_current(exit_code);

        // We've now been unscheduled, so we
        // switch to the next thread.
        self.dispatch();
        panic!("terminated thread was scheduled again");
    }

    /// Performs the teardown part of [`terminate`](Scheduler::terminate),
    /// leaving the thread to be switched away from.
    ///
    pub(crate) fn retire_current(&self, exit_code: i32) {
        let current = self.current_thread();
        if current.is_idle() {
            panic!("idle thread tried to exit");
        }

        current.set_exit_code(exit_code);
        current.set_state(ThreadState::Terminated);

        if let Some(handle) = current.set_handle(None) {
            self.handles.release(handle);
        }

        if let Some(user) = self.without_interrupts(|| current.take_user_context()) {
            user.release(&*self.memory);
        }

        self.debugger.thread_exited(&current);
        debug!(
            "thread {} ({}) exited with code {}",
            current.id(),
            current.name(),
            exit_code
        );

        // The kernel stack is still in use, so it is
        // freed from the system task queue once we have
        // switched away.
        let task = current.reclaim_task().clone();
        let id = current.id().as_u64() as usize;
        if let Err(err) = self.queue_task(None, &task, reclaim_thread, id) {
            error!("failed to queue reclamation of thread {}: {}", current.id(), err);
        }
    }
}

/// Removes a terminated thread from the set of all
/// threads and frees its kernel stack.
///
fn reclaim_thread(scheduler: &Scheduler, arg: usize) {
    let id = ThreadId::new(arg as u64);
    let thread = scheduler.without_interrupts(|| scheduler.threads.lock().remove(&id));
    let thread = match thread {
        Some(thread) => thread,
        None => {
            warn!("cannot reclaim unknown thread {}", id);
            return;
        }
    };

    if let Some(stack) = scheduler.without_interrupts(|| thread.take_kernel_stack()) {
        unsafe { stack.release(&*scheduler.memory) };
    }

    debug!("reclaimed thread {} ({})", id, thread.name());
}

/// The kernel entry point of every user thread, which
/// drops into user mode.
///
fn user_thread_start(scheduler: &Scheduler, _arg: usize) {
    let current = scheduler.current_thread();
    let target = scheduler.without_interrupts(|| current.user_entry());

    let (entry_point, stack_top, tib) = match target {
        Some(target) => target,
        None => panic!("user thread {} has no user context", current.id()),
    };

    drop(current);
    unsafe { scheduler.machine().enter_user_mode(entry_point, stack_top, tib) };
}
