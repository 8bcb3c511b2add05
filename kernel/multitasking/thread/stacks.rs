// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Includes helpers for managing the stacks used for kernel threads.
//!
//! Each kernel thread (other than the idle thread, which keeps the stack
//! it was given by the bootloader) has its own stack, allocated from the
//! memory manager with [`KernelStack::allocate`]. The stack is aligned to
//! its own size and zeroed before use. It is returned to the memory
//! manager once the thread has terminated and been reclaimed.

use crate::config::PAGE_SIZE;
use crate::error::Error;
use crate::memory::MemoryManager;
use x86_64::VirtAddr;

/// Describes the address space used for a stack.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    start: VirtAddr,
    end: VirtAddr,
}

impl StackBounds {
    /// Returns a set of stack bounds covering `pages`
    /// pages, starting at `start`.
    ///
    pub fn from_pages(start: VirtAddr, pages: usize) -> Self {
        StackBounds {
            start,
            end: start + ((pages * PAGE_SIZE) as u64 - 1),
        }
    }

    /// Returns the smallest valid address in the stack bounds.
    /// As the stack grows downwards, this is also known as the
    /// bottom of the stack.
    ///
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    /// Returns the largest valid address in the stack bounds.
    ///
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    /// Returns the address just past the end of the stack,
    /// which is the initial stack pointer.
    ///
    pub fn top(&self) -> VirtAddr {
        self.end + 1u64
    }

    /// Returns the number of pages included in the bounds.
    ///
    pub fn num_pages(&self) -> u64 {
        ((self.end - self.start) + (PAGE_SIZE as u64 - 1)) / PAGE_SIZE as u64
    }

    /// Returns whether the stack bounds include the given
    /// virtual address.
    ///
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.start <= addr && addr <= self.end
    }
}

/// A kernel stack owned by a thread.
///
#[derive(Debug)]
pub struct KernelStack {
    bounds: StackBounds,
    pages: usize,
}

impl KernelStack {
    /// Allocates and zeroes a kernel stack of `pages`
    /// pages, aligned to its own size.
    ///
    pub fn allocate(memory: &dyn MemoryManager, pages: usize) -> Result<Self, Error> {
        let start = memory.alloc_pages(pages, pages).ok_or(Error::OutOfMemory)?;

        // Clear the stack, so stale data never leaks
        // into a new thread.
        unsafe { core::ptr::write_bytes(start.as_mut_ptr::<u8>(), 0, pages * PAGE_SIZE) };

        Ok(KernelStack {
            bounds: StackBounds::from_pages(start, pages),
            pages,
        })
    }

    /// Returns the addresses covered by the stack.
    ///
    pub fn bounds(&self) -> StackBounds {
        self.bounds
    }

    /// Returns the initial stack pointer.
    ///
    pub fn top(&self) -> VirtAddr {
        self.bounds.top()
    }

    /// Returns the stack to the memory manager.
    ///
    /// # Safety
    ///
    /// The stack must no longer be in use.
    ///
    pub unsafe fn release(self, memory: &dyn MemoryManager) {
        memory.free_pages(self.bounds.start(), self.pages);
    }
}
