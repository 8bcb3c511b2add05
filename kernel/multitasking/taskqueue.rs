// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements task queues, which run deferred work on a dedicated thread.
//!
//! Unlike DPCs, tasks run in an ordinary thread context, so they may
//! block. Each [`TaskQueue`] has its own worker thread, which runs the
//! queue's tasks in the order they were submitted and waits when the
//! queue is empty.
//!
//! The scheduler creates one system task queue, which is unbounded and
//! runs at a high priority. It is used for work such as freeing the
//! resources of terminated threads. Other subsystems can create their
//! own queues with [`Scheduler::create_task_queue`].

use crate::error::Error;
use crate::scheduler::Scheduler;
use crate::thread::{Priority, Thread, ThreadState};
use crate::work::{DeferredFn, WorkSlot, WorkState};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use log::debug;
use spin::{Mutex, Once};

/// A unit of deferred work, owned by the subsystem
/// that submits it.
///
#[derive(Debug)]
pub struct Task {
    slot: WorkSlot,
}

impl Task {
    pub const fn new() -> Self {
        Task {
            slot: WorkSlot::new(),
        }
    }

    /// Returns the task's current state.
    ///
    pub fn state(&self) -> WorkState {
        self.slot.state()
    }

    /// Returns whether the task is waiting in a queue.
    ///
    pub fn is_queued(&self) -> bool {
        self.slot.is_queued()
    }
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

/// A FIFO of tasks, drained by a worker thread.
///
/// The pending tasks are only locked with interrupts
/// disabled. Their count and whether a callback is
/// running are also kept in atomics, so they can be
/// read from any context.
///
pub struct TaskQueue {
    name: &'static str,
    max_size: Option<usize>,
    pending: Mutex<VecDeque<Arc<Task>>>,
    len: AtomicUsize,

    // Set while a task's callback is running.
    active: AtomicBool,

    worker: Once<Arc<Thread>>,
}

impl TaskQueue {
    fn new(name: &'static str, max_size: Option<usize>) -> Self {
        TaskQueue {
            name,
            max_size,
            pending: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            worker: Once::new(),
        }
    }

    /// Returns the queue's name, which is also the name
    /// of its worker thread.
    ///
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the maximum number of pending tasks, or
    /// `None` if the queue is unbounded.
    ///
    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Returns the number of pending tasks.
    ///
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether a task's callback is running.
    ///
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Returns the queue's worker thread.
    ///
    pub fn worker(&self) -> Option<&Arc<Thread>> {
        self.worker.get()
    }

    /// Appends `task` to the queue, to call
    /// `proc(scheduler, arg)`.
    ///
    /// If the worker is waiting for work, it is woken.
    /// Submitting a task that is already queued fails
    /// with [`Error::AlreadyQueued`], and submitting to
    /// a full queue fails with [`Error::CapacityExceeded`].
    /// In both cases, the queue is unchanged.
    ///
    pub fn submit(
        &self,
        scheduler: &Scheduler,
        task: &Arc<Task>,
        proc: DeferredFn,
        arg: usize,
    ) -> Result<(), Error> {
        scheduler.without_interrupts(|| {
            let mut pending = self.pending.lock();
            if task.slot.is_queued() {
                return Err(Error::AlreadyQueued);
            }

            if let Some(max_size) = self.max_size {
                if pending.len() >= max_size {
                    return Err(Error::CapacityExceeded);
                }
            }

            task.slot.enqueue(proc, arg);
            pending.push_back(task.clone());
            self.len.store(pending.len(), Ordering::Release);

            if !self.is_active() {
                if let Some(worker) = self.worker.get() {
                    if worker.state() == ThreadState::Waiting {
                        scheduler.mark_ready(worker);
                    }
                }
            }

            Ok(())
        })
    }

    /// Runs the task at the head of the queue. This must
    /// be called by the queue's worker thread.
    ///
    /// If the queue is empty, the worker waits until a
    /// task is submitted and `run_once` returns false.
    ///
    pub fn run_once(&self, scheduler: &Scheduler) -> bool {
        let next = scheduler.without_interrupts(|| {
            let mut pending = self.pending.lock();
            match pending.pop_front() {
                Some(task) => {
                    self.len.store(pending.len(), Ordering::Release);
                    let callback = task.slot.begin();
                    self.active.store(callback.is_some(), Ordering::Release);
                    Some((task, callback))
                }
                None => {
                    // Go to sleep. Any submission from now
                    // on sees us waiting and wakes us.
                    scheduler.current_thread().set_state(ThreadState::Waiting);
                    None
                }
            }
        });

        let (task, callback) = match next {
            Some(next) => next,
            None => {
                scheduler.dispatch();
                return false;
            }
        };

        if let Some((proc, arg)) = callback {
            proc(scheduler, arg);
            scheduler.without_interrupts(|| {
                self.active.store(false, Ordering::Release);
                task.slot.finish();
            });
        }

        true
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("name", &self.name)
            .field("max_size", &self.max_size)
            .field("len", &self.len())
            .field("active", &self.is_active())
            .finish()
    }
}

/// The entry point for each task queue's worker
/// thread.
///
fn task_queue_worker(scheduler: &Scheduler, arg: usize) {
    // The queue was leaked when the worker was created,
    // so it lives forever.
    let queue = unsafe { &*(arg as *const TaskQueue) };
    loop {
        queue.run_once(scheduler);
    }
}

impl Scheduler {
    /// Creates a task queue, whose worker thread runs
    /// at `priority`.
    ///
    /// If `max_size` is `None`, the queue is unbounded.
    ///
    pub fn create_task_queue(
        &self,
        priority: Priority,
        max_size: Option<usize>,
        name: &'static str,
    ) -> Result<Arc<TaskQueue>, Error> {
        let queue = Arc::new(TaskQueue::new(name, max_size));
        let raw = Arc::into_raw(queue.clone());
        match self.create_kernel_thread(task_queue_worker, raw as usize, priority, name) {
            Ok(worker) => {
                queue.worker.call_once(|| worker);
                debug!("created task queue {} at priority {:?}", name, priority);
                Ok(queue)
            }
            Err(err) => {
                drop(unsafe { Arc::from_raw(raw) });
                Err(err)
            }
        }
    }

    /// Submits `task` to `queue`, or to the system
    /// task queue if `queue` is `None`.
    ///
    /// See [`TaskQueue::submit`].
    ///
    pub fn queue_task(
        &self,
        queue: Option<&TaskQueue>,
        task: &Arc<Task>,
        proc: DeferredFn,
        arg: usize,
    ) -> Result<(), Error> {
        let queue = match queue {
            Some(queue) => queue,
            None => &**self.system_tasks(),
        };

        queue.submit(self, task, proc, arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::boot;
    use alloc::vec::Vec;

    static LOG: Mutex<Vec<usize>> = Mutex::new(Vec::new());

    fn record(_scheduler: &Scheduler, arg: usize) {
        LOG.lock().push(arg);
    }

    /// Switches to the queue's worker, which must be
    /// the best ready thread.
    ///
    fn run_worker(scheduler: &Scheduler, queue: &TaskQueue) {
        scheduler.yield_now();
        assert!(Arc::ptr_eq(
            &scheduler.current_thread(),
            queue.worker().unwrap()
        ));
    }

    #[test]
    fn bounded_queue() {
        let (scheduler, _test) = boot();
        let queue = scheduler
            .create_task_queue(Priority::Highest, Some(2), "bounded")
            .unwrap();
        assert_eq!(queue.name(), "bounded");
        assert_eq!(queue.max_size(), Some(2));

        // Let the worker reach its waiting state.
        run_worker(&scheduler, &queue);
        assert!(!queue.run_once(&scheduler));
        assert!(scheduler.current_thread().is_idle());

        let tasks: Vec<Arc<Task>> = (0..4).map(|_| Arc::new(Task::new())).collect();
        assert_eq!(queue.submit(&scheduler, &tasks[0], record, 10), Ok(()));
        assert_eq!(queue.submit(&scheduler, &tasks[1], record, 11), Ok(()));
        assert_eq!(
            queue.submit(&scheduler, &tasks[2], record, 12),
            Err(Error::CapacityExceeded)
        );
        assert_eq!(queue.len(), 2);
        assert!(!tasks[2].is_queued());

        // Once the worker has run one task, there is
        // room again.
        LOG.lock().clear();
        run_worker(&scheduler, &queue);
        assert!(queue.run_once(&scheduler));
        assert_eq!(*LOG.lock(), [10]);
        assert_eq!(queue.submit(&scheduler, &tasks[3], record, 13), Ok(()));

        assert!(queue.run_once(&scheduler));
        assert!(queue.run_once(&scheduler));
        assert_eq!(*LOG.lock(), [10, 11, 13]);
        assert!(queue.is_empty());
        assert_eq!(tasks[0].state(), WorkState::Idle);
    }

    #[test]
    fn already_queued() {
        let (scheduler, _test) = boot();
        let task = Arc::new(Task::new());
        assert_eq!(scheduler.queue_task(None, &task, record, 1), Ok(()));
        assert_eq!(
            scheduler.queue_task(None, &task, record, 2),
            Err(Error::AlreadyQueued)
        );
        assert_eq!(scheduler.system_tasks().len(), 1);
        assert!(task.is_queued());
    }

    #[test]
    fn submit_wakes_waiting_worker() {
        let (scheduler, _test) = boot();
        let worker = scheduler.system_tasks().worker().unwrap().clone();
        assert_eq!(worker.state(), ThreadState::Waiting);

        let task = Arc::new(Task::new());
        scheduler.queue_task(None, &task, record, 5).unwrap();
        assert_eq!(worker.state(), ThreadState::Ready);
        assert!(scheduler.reschedule_requested());
        assert_eq!(scheduler.ready_count(), 1);
    }

    #[test]
    fn resubmitted_while_running() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        static TASK: Once<Arc<Task>> = Once::new();

        fn again(scheduler: &Scheduler, _arg: usize) {
            if CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
                // The active queue does not wake the
                // worker, which is already running.
                let task = TASK.get().unwrap();
                scheduler.queue_task(None, task, again, 0).unwrap();
                assert_eq!(task.state(), WorkState::Executing { requeued: true });
                assert!(scheduler.system_tasks().is_active());
            }
        }

        let (scheduler, _test) = boot();
        let task = TASK.call_once(|| Arc::new(Task::new()));
        scheduler.queue_task(None, task, again, 0).unwrap();
        run_worker(&scheduler, scheduler.system_tasks());

        assert!(scheduler.system_tasks().run_once(&scheduler));
        assert_eq!(task.state(), WorkState::Queued);
        assert!(!scheduler.system_tasks().is_active());
        assert_eq!(scheduler.ready_count(), 1);

        assert!(scheduler.system_tasks().run_once(&scheduler));
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
        assert_eq!(task.state(), WorkState::Idle);
    }

    #[test]
    fn counters_read_without_locking() {
        let (scheduler, _test) = boot();
        let task = Arc::new(Task::new());
        scheduler.queue_task(None, &task, record, 1).unwrap();

        // A DPC may read the queue while the interrupted
        // thread holds its lock.
        let queue = scheduler.system_tasks();
        let _pending = queue.pending.lock();
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_active());
        assert!(task.is_queued());
        assert_eq!(task.state(), WorkState::Queued);
    }

    #[test]
    fn create_out_of_memory() {
        let (scheduler, test) = boot();
        test.memory.fail_after(0);
        assert_eq!(
            scheduler
                .create_task_queue(Priority::Normal, None, "oom")
                .unwrap_err(),
            Error::OutOfMemory
        );
    }
}
