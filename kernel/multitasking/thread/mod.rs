// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements preemptive multitasking, using independent threads of execution.
//!
//! This module defines the thread record and its life cycle. Each thread
//! has its own kernel stack and a fixed [`Priority`]. User threads also
//! have a thread information block and a user stack.
//!
//! ## Manipulating threads
//!
//! Kernel threads are created with [`Scheduler::create_kernel_thread`]
//! and are ready to run immediately. User threads are created with
//! [`Scheduler::create_user_thread`] and start suspended, so the caller
//! must call [`Scheduler::resume`] before they run.
//!
//! A running thread may block with [`Scheduler::block_current`], and is
//! made runnable again with [`Scheduler::mark_ready`]. It terminates by
//! calling [`Scheduler::terminate`], after which its kernel stack is
//! freed by the system task queue.
//!
//! [`Scheduler::threads`] returns a snapshot of every thread, which can
//! be printed with [`ThreadTable`].

mod lifecycle;
mod stacks;
mod tib;

pub use self::stacks::{KernelStack, StackBounds};
pub use self::tib::{ThreadInfo, UserContext, UserStack, TLS_SLOTS};

use crate::machine::{FpuState, Machine};
use crate::objects::{Handle, HandleTable};
use crate::scheduler::Scheduler;
use crate::taskqueue::Task;
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use crossbeam_utils::atomic::AtomicCell;
use spin::Mutex;
use x86_64::VirtAddr;

/// The entry point of a kernel thread.
///
/// The second argument is the value passed when the
/// thread was created. If the entry point returns,
/// the thread terminates with exit code 0.
///
pub type ThreadEntry = fn(&Scheduler, usize);

/// Uniquely identifies a thread within a scheduler.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// IDLE is the unique thread id for the idle thread.
    ///
    pub const IDLE: Self = ThreadId(0);

    pub(crate) const fn new(id: u64) -> Self {
        ThreadId(id)
    }

    /// Returns a numerical representation for the thread
    /// ID.
    ///
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Describes the scheduling state of a thread.
///
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ThreadState {
    /// The thread has been created but has
    /// never been made ready.
    Initialized,

    /// The thread is waiting in a ready queue.
    Ready,

    /// The thread is executing.
    Running,

    /// The thread is blocked until something
    /// marks it ready.
    Waiting,

    /// The thread has exited.
    Terminated,
}

impl ThreadState {
    /// Returns the short name used in thread listings.
    ///
    pub const fn name(self) -> &'static str {
        match self {
            ThreadState::Initialized => "init",
            ThreadState::Ready => "ready",
            ThreadState::Running => "run",
            ThreadState::Waiting => "wait",
            ThreadState::Terminated => "term",
        }
    }
}

/// A thread's scheduling priority.
///
/// Higher priorities always run before lower ones.
/// The idle thread alone runs at [`Priority::Idle`].
///
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(u8)]
pub enum Priority {
    Idle = 0,
    Lowest = 1,
    BelowNormal = 2,
    Normal = 3,
    AboveNormal = 4,
    Highest = 5,
    System = 6,
    TimeCritical = 7,
}

impl Priority {
    /// The number of priority levels.
    ///
    pub const LEVELS: usize = 8;

    /// Returns the priority's ready queue index.
    ///
    pub const fn level(self) -> usize {
        self as usize
    }

    /// Returns the priority with the given level,
    /// if any.
    ///
    pub const fn from_level(level: usize) -> Option<Self> {
        match level {
            0 => Some(Priority::Idle),
            1 => Some(Priority::Lowest),
            2 => Some(Priority::BelowNormal),
            3 => Some(Priority::Normal),
            4 => Some(Priority::AboveNormal),
            5 => Some(Priority::Highest),
            6 => Some(Priority::System),
            7 => Some(Priority::TimeCritical),
            _ => None,
        }
    }
}

/// Contains the metadata for a thread of
/// execution.
///
pub struct Thread {
    // This thread's unique id. The idle thread
    // always has the thread id 0.
    id: ThreadId,

    name: &'static str,
    priority: Priority,

    // The thread's current state.
    state: AtomicCell<ThreadState>,

    // The thread only runs while this is zero.
    suspend_count: AtomicU32,

    exit_code: AtomicI32,

    // The address the thread started executing at,
    // kept for introspection.
    entry_point: usize,

    // The thread's kernel stack. The idle thread
    // runs on the boot stack, so has none. This is
    // taken when the thread is reclaimed.
    kernel_stack: Mutex<Option<KernelStack>>,
    kernel_stack_bounds: Option<StackBounds>,
    kernel_stack_freed: AtomicBool,

    // The thread's saved stack pointer. While the
    // thread is executing, this value will be stale.
    // When the thread is switched out, its final stack
    // pointer is written to this cell. When the thread
    // is resumed, its stack pointer is restored from
    // this value.
    stack_pointer: UnsafeCell<u64>,

    // The thread information block and user stack,
    // for user threads. The block's address is also
    // kept in tib, or zero, so the dispatcher can
    // read it without taking the lock.
    user: Mutex<Option<UserContext>>,
    tib: AtomicU64,

    // The thread's handle in the object table, for
    // user threads.
    handle: AtomicCell<Option<Handle>>,

    // Whether the thread is in a ready queue.
    enqueued: AtomicBool,

    // Whether the thread has used the FPU since it
    // was last switched in, and its saved FPU state.
    fpu_used: AtomicBool,
    fpu_saved: AtomicBool,
    fpu_state: Mutex<Option<Box<FpuState>>>,

    // Used to free the thread's kernel stack once it
    // has terminated.
    reclaim: Arc<Task>,
}

// The stack pointer cell is only accessed by the
// dispatcher with interrupts disabled.
//
// The interrupt path also reaches the mutexes above,
// so they are only locked with interrupts disabled.
unsafe impl Sync for Thread {}

impl Thread {
    /// Creates the record for the idle thread, which
    /// takes over the boot thread's stack.
    ///
    pub(crate) fn new_idle_thread() -> Self {
        let thread = Thread::new(ThreadId::IDLE, "idle", Priority::Idle, 0, None, 0);
        thread.set_state(ThreadState::Running);
        thread
    }

    /// Creates a new thread record in the
    /// [`Initialized`](ThreadState::Initialized) state.
    ///
    pub(crate) fn new(
        id: ThreadId,
        name: &'static str,
        priority: Priority,
        entry_point: usize,
        kernel_stack: Option<KernelStack>,
        stack_pointer: u64,
    ) -> Self {
        let kernel_stack_bounds = kernel_stack.as_ref().map(|stack| stack.bounds());
        Thread {
            id,
            name,
            priority,
            state: AtomicCell::new(ThreadState::Initialized),
            suspend_count: AtomicU32::new(0),
            exit_code: AtomicI32::new(0),
            entry_point,
            kernel_stack: Mutex::new(kernel_stack),
            kernel_stack_bounds,
            kernel_stack_freed: AtomicBool::new(false),
            stack_pointer: UnsafeCell::new(stack_pointer),
            user: Mutex::new(None),
            tib: AtomicU64::new(0),
            handle: AtomicCell::new(None),
            enqueued: AtomicBool::new(false),
            fpu_used: AtomicBool::new(false),
            fpu_saved: AtomicBool::new(false),
            fpu_state: Mutex::new(None),
            reclaim: Arc::new(Task::new()),
        }
    }

    /// Returns the thread's unique id.
    ///
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Returns the thread's name.
    ///
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the thread's priority.
    ///
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns whether this is the idle thread.
    ///
    pub fn is_idle(&self) -> bool {
        self.id == ThreadId::IDLE
    }

    /// Returns the thread's current scheduling state.
    ///
    pub fn state(&self) -> ThreadState {
        self.state.load()
    }

    pub(crate) fn set_state(&self, new_state: ThreadState) {
        self.state.store(new_state);
    }

    /// Returns the number of outstanding suspensions.
    ///
    pub fn suspend_count(&self) -> u32 {
        self.suspend_count.load(Ordering::Acquire)
    }

    /// Returns whether the thread is prevented from
    /// running.
    ///
    pub fn is_suspended(&self) -> bool {
        self.suspend_count() > 0
    }

    /// Returns the thread's exit code. This is only
    /// meaningful once the thread has terminated.
    ///
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Returns the address the thread started at.
    ///
    pub fn entry_point(&self) -> usize {
        self.entry_point
    }

    /// Returns the thread's object table handle, if
    /// it has one.
    ///
    pub fn handle(&self) -> Option<Handle> {
        self.handle.load()
    }

    /// Returns the address of the thread information
    /// block, for user threads.
    ///
    pub fn tib(&self) -> Option<VirtAddr> {
        match self.tib.load(Ordering::Acquire) {
            0 => None,
            addr => Some(VirtAddr::new(addr)),
        }
    }

    /// Returns the bounds of the thread's kernel stack,
    /// unless it has been freed.
    ///
    pub fn kernel_stack(&self) -> Option<StackBounds> {
        if self.kernel_stack_freed.load(Ordering::Acquire) {
            return None;
        }

        self.kernel_stack_bounds
    }

    /// Returns the top of the thread's kernel stack,
    /// which is used for interrupts from user mode.
    ///
    pub(crate) fn kernel_stack_top(&self) -> Option<VirtAddr> {
        self.kernel_stack_bounds.map(|bounds| bounds.top())
    }

    /// Returns a pointer to the thread's saved stack
    /// pointer.
    ///
    pub(crate) fn stack_pointer(&self) -> *mut u64 {
        self.stack_pointer.get()
    }

    /// Records that the thread is in a ready queue,
    /// returning whether it already was.
    ///
    pub(crate) fn set_enqueued(&self, enqueued: bool) -> bool {
        self.enqueued.swap(enqueued, Ordering::AcqRel)
    }

    /// Returns whether the thread has used the FPU
    /// since it was last switched in.
    ///
    pub fn fpu_used(&self) -> bool {
        self.fpu_used.load(Ordering::Acquire)
    }

    pub(crate) fn set_fpu_used(&self, used: bool) -> bool {
        self.fpu_used.swap(used, Ordering::AcqRel)
    }

    /// Returns whether the thread has saved FPU state.
    ///
    pub fn has_fpu_state(&self) -> bool {
        self.fpu_saved.load(Ordering::Acquire)
    }

    /// Saves the FPU's state into the thread. This must
    /// be called with interrupts disabled.
    ///
    pub(crate) fn save_fpu_state(&self, machine: &dyn Machine) {
        let mut state = self.fpu_state.lock();
        machine.fpu_save(state.get_or_insert_with(|| Box::new(FpuState::new())));
        self.fpu_saved.store(true, Ordering::Release);
    }

    /// Loads the thread's saved FPU state, or resets the
    /// FPU if there is none. This must be called with
    /// interrupts disabled.
    ///
    pub(crate) fn restore_fpu_state(&self, machine: &dyn Machine) {
        machine.fpu_restore(self.fpu_state.lock().as_deref());
    }

    /// Gives the thread its user context. This must be
    /// called with interrupts disabled.
    ///
    pub(crate) fn set_user_context(&self, user: UserContext) {
        let tib = user.tib();
        *self.user.lock() = Some(user);
        self.tib.store(tib.as_u64(), Ordering::Release);
    }

    /// Removes the thread's user context. This must be
    /// called with interrupts disabled.
    ///
    pub(crate) fn take_user_context(&self) -> Option<UserContext> {
        self.tib.store(0, Ordering::Release);
        self.user.lock().take()
    }

    /// Returns the user mode entry point and stack top,
    /// followed by the thread information block. This
    /// must be called with interrupts disabled.
    ///
    pub(crate) fn user_entry(&self) -> Option<(VirtAddr, VirtAddr, VirtAddr)> {
        self.user
            .lock()
            .as_ref()
            .and_then(|user| Some((user.entry_point(), user.stack()?.top(), user.tib())))
    }

    /// Removes the thread's kernel stack. This must be
    /// called with interrupts disabled.
    ///
    pub(crate) fn take_kernel_stack(&self) -> Option<KernelStack> {
        self.kernel_stack_freed.store(true, Ordering::Release);
        self.kernel_stack.lock().take()
    }

    pub(crate) fn set_handle(&self, handle: Option<Handle>) -> Option<Handle> {
        self.handle.swap(handle)
    }

    pub(crate) fn reclaim_task(&self) -> &Arc<Task> {
        &self.reclaim
    }

    /// Increments the suspend count, returning its
    /// previous value.
    ///
    pub(crate) fn increment_suspend_count(&self) -> u32 {
        self.suspend_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Decrements the suspend count if it is non-zero,
    /// returning its previous value.
    ///
    pub(crate) fn decrement_suspend_count(&self) -> u32 {
        match self
            .suspend_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            }) {
            Ok(prev) => prev,
            Err(prev) => prev,
        }
    }

    pub(crate) fn set_exit_code(&self, exit_code: i32) {
        self.exit_code.store(exit_code, Ordering::Release);
    }

    /// Returns a snapshot of the thread's state.
    ///
    pub fn snapshot(&self, handles: &dyn HandleTable) -> ThreadSnapshot {
        let handle = self.handle();
        ThreadSnapshot {
            id: self.id,
            name: self.name,
            state: self.state(),
            priority: self.priority,
            suspend_count: self.suspend_count(),
            tib: self.tib(),
            entry_point: self.entry_point,
            handle,
            handle_count: handle.map(|handle| handles.handle_count(handle)).unwrap_or(0),
        }
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("state", &self.state())
            .field("suspend_count", &self.suspend_count())
            .field("kernel_stack", &self.kernel_stack())
            .field("handle", &self.handle())
            .finish()
    }
}

/// A point-in-time copy of a thread's metadata.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub id: ThreadId,
    pub name: &'static str,
    pub state: ThreadState,
    pub priority: Priority,
    pub suspend_count: u32,
    pub tib: Option<VirtAddr>,
    pub entry_point: usize,
    pub handle: Option<Handle>,
    pub handle_count: usize,
}

/// Formats a list of thread snapshots as a table,
/// with one row per thread.
///
pub struct ThreadTable<'snapshots>(pub &'snapshots [ThreadSnapshot]);

impl<'snapshots> fmt::Display for ThreadTable<'snapshots> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "tid self state prio tib                suspend entry              handles name"
        )?;
        writeln!(
            f,
            "--- ---- ----- ---- ------------------ ------- ------------------ ------- ----------------"
        )?;
        for thread in self.0.iter() {
            let handle = match thread.handle {
                Some(handle) => handle.0,
                None => 0,
            };
            let tib = thread.tib.map(|tib| tib.as_u64()).unwrap_or(0);
            writeln!(
                f,
                "{:3} {:4} {:<5} {:4} {:#018x} {:7} {:#018x} {:7} {}",
                thread.id,
                handle,
                thread.state.name(),
                thread.priority as u8,
                tib,
                thread.suspend_count,
                thread.entry_point,
                thread.handle_count,
                thread.name
            )?;
        }

        Ok(())
    }
}
