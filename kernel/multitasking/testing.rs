// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides in-memory implementations of the scheduler's collaborators,
//! for use in unit tests.
//!
//! [`DebugMachine`] never really switches stacks. Once
//! [`Scheduler::dispatch`] returns, the test continues as if it were
//! running in whichever thread is now current.

use crate::config::{Config, PAGE_SIZE};
use crate::machine::{FpuState, Machine};
use crate::memory::{MapFlags, MemoryManager, Protection};
use crate::objects::{Debugger, Handle, HandleTable, Platform};
use crate::switch::seed_stack;
use crate::thread::{Thread, ThreadEntry, ThreadId};
use crate::Scheduler;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use spin::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use x86_64::VirtAddr;

/// A [`Machine`] that records what the scheduler
/// asks of it.
///
pub struct DebugMachine {
    interrupts: AtomicBool,
    halts: AtomicUsize,
    switches: AtomicUsize,
    last_switch_target: Mutex<Option<u64>>,
    kernel_stack: Mutex<Option<VirtAddr>>,
    tls: Mutex<Option<VirtAddr>>,
    fpu_trap: AtomicBool,
    fpu_saves: AtomicUsize,
    fpu_restores: AtomicUsize,
}

impl DebugMachine {
    /// Returns a machine with interrupts disabled, as
    /// they are at boot.
    ///
    pub fn new() -> Self {
        DebugMachine {
            interrupts: AtomicBool::new(false),
            halts: AtomicUsize::new(0),
            switches: AtomicUsize::new(0),
            last_switch_target: Mutex::new(None),
            kernel_stack: Mutex::new(None),
            tls: Mutex::new(None),
            fpu_trap: AtomicBool::new(false),
            fpu_saves: AtomicUsize::new(0),
            fpu_restores: AtomicUsize::new(0),
        }
    }

    pub fn set_interrupts(&self, enabled: bool) {
        self.interrupts.store(enabled, Ordering::SeqCst);
    }

    pub fn halts(&self) -> usize {
        self.halts.load(Ordering::SeqCst)
    }

    pub fn switches(&self) -> usize {
        self.switches.load(Ordering::SeqCst)
    }

    /// Returns the stack pointer loaded by the most
    /// recent switch.
    ///
    pub fn last_switch_target(&self) -> Option<u64> {
        *self.last_switch_target.lock()
    }

    pub fn kernel_stack(&self) -> Option<VirtAddr> {
        *self.kernel_stack.lock()
    }

    pub fn tls(&self) -> Option<VirtAddr> {
        *self.tls.lock()
    }

    pub fn fpu_trap_armed(&self) -> bool {
        self.fpu_trap.load(Ordering::SeqCst)
    }

    pub fn fpu_saves(&self) -> usize {
        self.fpu_saves.load(Ordering::SeqCst)
    }

    pub fn fpu_restores(&self) -> usize {
        self.fpu_restores.load(Ordering::SeqCst)
    }
}

impl Machine for DebugMachine {
    fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    fn enable_interrupts(&self) {
        self.set_interrupts(true);
    }

    fn disable_interrupts(&self) {
        self.set_interrupts(false);
    }

    fn wait_for_interrupt(&self) {
        self.set_interrupts(true);
        self.halts.fetch_add(1, Ordering::SeqCst);
    }

    unsafe fn prepare_stack(&self, top: VirtAddr, entry: ThreadEntry, arg: usize) -> u64 {
        seed_stack(top, 0, entry as usize as u64, arg as u64)
    }

    unsafe fn switch_stack(&self, _current: *mut u64, new: *const u64) {
        self.switches.fetch_add(1, Ordering::SeqCst);
        *self.last_switch_target.lock() = Some(new.read());
    }

    fn set_kernel_stack(&self, top: VirtAddr) {
        *self.kernel_stack.lock() = Some(top);
    }

    fn install_tls(&self, tib: VirtAddr) {
        *self.tls.lock() = Some(tib);
    }

    fn fpu_save(&self, state: &mut FpuState) {
        state.0[0] = 1;
        self.fpu_saves.fetch_add(1, Ordering::SeqCst);
    }

    fn fpu_restore(&self, _state: Option<&FpuState>) {
        self.fpu_restores.fetch_add(1, Ordering::SeqCst);
    }

    fn set_fpu_trap(&self, armed: bool) {
        self.fpu_trap.store(armed, Ordering::SeqCst);
    }

    unsafe fn enter_user_mode(&self, entry: VirtAddr, _stack_top: VirtAddr, _tib: VirtAddr) -> ! {
        panic!("cannot enter user mode at {:?} in tests", entry);
    }
}

/// A mapped region of virtual memory.
///
struct Region {
    layout: Layout,
    commits: Vec<(VirtAddr, usize, Protection)>,
}

/// A [`MemoryManager`] backed by the heap.
///
/// Every allocation is real, zeroed memory. Freeing
/// pages that are not allocated panics.
///
pub struct DebugMemory {
    pages: Mutex<BTreeMap<u64, (Layout, usize)>>,
    regions: Mutex<BTreeMap<u64, Region>>,

    // The number of allocations that may succeed
    // before allocations start failing.
    remaining: Mutex<Option<usize>>,
}

impl DebugMemory {
    pub fn new() -> Self {
        DebugMemory {
            pages: Mutex::new(BTreeMap::new()),
            regions: Mutex::new(BTreeMap::new()),
            remaining: Mutex::new(None),
        }
    }

    /// Lets `successes` more allocations or mappings
    /// succeed, then fails all further ones.
    ///
    pub fn fail_after(&self, successes: usize) {
        *self.remaining.lock() = Some(successes);
    }

    /// Lets all further allocations succeed.
    ///
    pub fn never_fail(&self) {
        *self.remaining.lock() = None;
    }

    fn charge(&self) -> bool {
        let mut remaining = self.remaining.lock();
        match *remaining {
            None => true,
            Some(0) => false,
            Some(ref mut remaining) => {
                *remaining -= 1;
                true
            }
        }
    }

    /// Returns the number of pages allocated and not
    /// yet freed.
    ///
    pub fn outstanding_pages(&self) -> usize {
        self.pages.lock().values().map(|(_, pages)| *pages).sum()
    }

    /// Returns the number of mapped regions.
    ///
    pub fn mapped_regions(&self) -> usize {
        self.regions.lock().len()
    }

    /// Returns the committed parts of the region mapped
    /// at `base`.
    ///
    pub fn committed(&self, base: VirtAddr) -> Vec<(VirtAddr, usize, Protection)> {
        match self.regions.lock().get(&base.as_u64()) {
            Some(region) => region.commits.clone(),
            None => Vec::new(),
        }
    }

    fn allocate(size: usize, align: usize) -> Option<(VirtAddr, Layout)> {
        let layout = Layout::from_size_align(size, align).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            None
        } else {
            Some((VirtAddr::from_ptr(ptr), layout))
        }
    }
}

impl MemoryManager for DebugMemory {
    fn alloc_pages(&self, pages: usize, align_pages: usize) -> Option<VirtAddr> {
        if !self.charge() {
            return None;
        }

        let (addr, layout) = Self::allocate(pages * PAGE_SIZE, align_pages.max(1) * PAGE_SIZE)?;
        self.pages.lock().insert(addr.as_u64(), (layout, pages));
        Some(addr)
    }

    unsafe fn free_pages(&self, addr: VirtAddr, pages: usize) {
        let (layout, allocated) = match self.pages.lock().remove(&addr.as_u64()) {
            Some(allocation) => allocation,
            None => panic!("freed unallocated pages at {:?}", addr),
        };

        assert_eq!(pages, allocated, "freed wrong number of pages at {:?}", addr);
        dealloc(addr.as_mut_ptr(), layout);
    }

    fn map(
        &self,
        addr: Option<VirtAddr>,
        size: usize,
        flags: MapFlags,
        protection: Protection,
    ) -> Option<VirtAddr> {
        if !self.charge() {
            return None;
        }

        let mut regions = self.regions.lock();
        match addr {
            None => {
                let rounded = ((size + PAGE_SIZE - 1) / PAGE_SIZE) * PAGE_SIZE;
                let (addr, layout) = Self::allocate(rounded, PAGE_SIZE)?;
                let mut commits = Vec::new();
                if flags.contains(MapFlags::COMMIT) {
                    commits.push((addr, size, protection));
                }

                regions.insert(addr.as_u64(), Region { layout, commits });
                Some(addr)
            }
            Some(addr) => {
                // Commit part of an existing reservation.
                let (base, region) = regions.range_mut(..=addr.as_u64()).next_back()?;
                if addr.as_u64() + size as u64 > base + region.layout.size() as u64 {
                    return None;
                }

                region.commits.push((addr, size, protection));
                Some(addr)
            }
        }
    }

    fn unmap(&self, addr: VirtAddr, size: usize) {
        let region = match self.regions.lock().remove(&addr.as_u64()) {
            Some(region) => region,
            None => panic!("unmapped unknown region at {:?}", addr),
        };

        assert!(size <= region.layout.size(), "unmapped too much at {:?}", addr);
        unsafe { dealloc(addr.as_mut_ptr(), region.layout) };
    }
}

impl Drop for DebugMemory {
    fn drop(&mut self) {
        for (addr, (layout, _)) in self.pages.lock().iter() {
            unsafe { dealloc(*addr as *mut u8, *layout) };
        }

        for (addr, region) in self.regions.lock().iter() {
            unsafe { dealloc(*addr as *mut u8, region.layout) };
        }
    }
}

/// A [`HandleTable`] that tracks open handles.
///
pub struct DebugHandles {
    next: AtomicU32,
    open: Mutex<BTreeMap<Handle, ThreadId>>,
    fail: AtomicBool,
}

impl DebugHandles {
    pub fn new() -> Self {
        DebugHandles {
            next: AtomicU32::new(1),
            open: Mutex::new(BTreeMap::new()),
            fail: AtomicBool::new(false),
        }
    }

    /// Sets whether handle allocation fails.
    ///
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of open handles.
    ///
    pub fn open(&self) -> usize {
        self.open.lock().len()
    }
}

impl HandleTable for DebugHandles {
    fn allocate(&self, thread: &Arc<Thread>) -> Option<Handle> {
        if self.fail.load(Ordering::SeqCst) {
            return None;
        }

        let handle = Handle(self.next.fetch_add(1, Ordering::SeqCst));
        self.open.lock().insert(handle, thread.id());
        Some(handle)
    }

    fn release(&self, handle: Handle) {
        if self.open.lock().remove(&handle).is_none() {
            panic!("released unknown handle {}", handle);
        }
    }

    fn handle_count(&self, handle: Handle) -> usize {
        usize::from(self.open.lock().contains_key(&handle))
    }
}

/// A [`Debugger`] that records thread notifications.
///
pub struct DebugHooks {
    created: Mutex<Vec<(ThreadId, usize)>>,
    exited: Mutex<Vec<ThreadId>>,
}

impl DebugHooks {
    pub fn new() -> Self {
        DebugHooks {
            created: Mutex::new(Vec::new()),
            exited: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> Vec<(ThreadId, usize)> {
        self.created.lock().clone()
    }

    pub fn exited(&self) -> Vec<ThreadId> {
        self.exited.lock().clone()
    }
}

impl Debugger for DebugHooks {
    fn thread_created(&self, thread: &Thread, entry: usize) {
        self.created.lock().push((thread.id(), entry));
    }

    fn thread_exited(&self, thread: &Thread) {
        self.exited.lock().push(thread.id());
    }
}

/// The collaborators of a test scheduler, kept so
/// tests can inspect them.
///
pub struct TestPlatform {
    pub machine: Arc<DebugMachine>,
    pub memory: Arc<DebugMemory>,
    pub handles: Arc<DebugHandles>,
    pub hooks: Arc<DebugHooks>,
}

impl TestPlatform {
    pub fn new() -> Self {
        TestPlatform {
            machine: Arc::new(DebugMachine::new()),
            memory: Arc::new(DebugMemory::new()),
            handles: Arc::new(DebugHandles::new()),
            hooks: Arc::new(DebugHooks::new()),
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            machine: self.machine.clone(),
            memory: self.memory.clone(),
            handles: self.handles.clone(),
            debugger: self.hooks.clone(),
        }
    }
}

/// Creates a scheduler and runs its system task
/// queue worker until it waits for work.
///
/// The idle thread is then current and nothing is
/// ready.
///
pub fn boot() -> (Scheduler, TestPlatform) {
    boot_with(Config::default())
}

pub fn boot_with(config: Config) -> (Scheduler, TestPlatform) {
    let test = TestPlatform::new();
    let scheduler = Scheduler::new(test.platform(), config).unwrap();

    scheduler.yield_now();
    assert_eq!(scheduler.current_thread().name(), "systask");
    assert!(!scheduler.system_tasks().run_once(&scheduler));
    assert!(scheduler.current_thread().is_idle());

    (scheduler, test)
}
