// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Describes the memory manager used to back kernel stacks, thread
//! information blocks, and user stacks.

use bitflags::bitflags;
use x86_64::VirtAddr;

bitflags! {
    /// Describes how a region of virtual memory should
    /// be mapped.
    ///
    pub struct MapFlags: u8 {
        /// Reserve the address range.
        const RESERVE = 1 << 0;

        /// Back the address range with memory.
        const COMMIT = 1 << 1;
    }
}

bitflags! {
    /// Describes the access permitted to a region of
    /// virtual memory.
    ///
    pub struct Protection: u8 {
        /// The memory can be read.
        const READ = 1 << 0;

        /// The memory can be written.
        const WRITE = 1 << 1;

        /// The memory is accessible from user mode.
        const USER = 1 << 2;

        /// The first access to each page faults, so the
        /// region can grow on demand.
        const GUARD = 1 << 3;
    }
}

/// Provides page-granular memory to the scheduler.
///
/// Kernel stacks are allocated as physically backed
/// pages. User context is allocated as mappings in
/// the current address space.
///
pub trait MemoryManager: Send + Sync {
    /// Allocates `pages` zeroed or uninitialised pages,
    /// aligned to a multiple of `align_pages` pages.
    ///
    fn alloc_pages(&self, pages: usize, align_pages: usize) -> Option<VirtAddr>;

    /// Returns pages allocated with [`alloc_pages`](MemoryManager::alloc_pages).
    ///
    /// # Safety
    ///
    /// The pages must not be used after they are freed.
    ///
    unsafe fn free_pages(&self, addr: VirtAddr, pages: usize);

    /// Maps `size` bytes of memory. If `addr` is `None`,
    /// the memory manager picks the address.
    ///
    fn map(
        &self,
        addr: Option<VirtAddr>,
        size: usize,
        flags: MapFlags,
        protection: Protection,
    ) -> Option<VirtAddr>;

    /// Releases a mapping created with [`map`](MemoryManager::map).
    ///
    fn unmap(&self, addr: VirtAddr, size: usize);
}
