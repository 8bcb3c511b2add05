// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Manages the user-mode context of user threads: the thread information
//! block (TIB) and the user stack.

use crate::config::PAGE_SIZE;
use crate::error::Error;
use crate::memory::{MapFlags, MemoryManager, Protection};
use crate::thread::ThreadId;
use core::mem::size_of;
use x86_64::VirtAddr;

/// The number of thread-local storage slots in each
/// thread information block.
///
pub const TLS_SLOTS: usize = 64;

/// The process id stored in every thread information
/// block.
///
const PROCESS_ID: u64 = 1;

/// The thread information block, which user code
/// reaches through the thread-local storage register.
///
#[repr(C)]
#[derive(Debug)]
pub struct ThreadInfo {
    /// The address of the block itself.
    pub self_ptr: u64,

    /// The address of the TLS slots.
    pub tls_base: u64,

    /// The lowest address of the user stack.
    pub stack_base: u64,

    /// The initial user stack pointer.
    pub stack_top: u64,

    /// The lowest committed address of the user
    /// stack.
    pub stack_limit: u64,

    pub tid: u64,
    pub pid: u64,
    pub tls: [u64; TLS_SLOTS],
}

/// A reserved user stack, whose top portion is
/// committed and whose remainder is guarded.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserStack {
    base: VirtAddr,
    top: VirtAddr,
    limit: VirtAddr,
}

impl UserStack {
    /// Reserves `size` bytes of user stack, committing
    /// the top `commit` bytes and committing the rest
    /// as guard pages.
    ///
    pub fn allocate(memory: &dyn MemoryManager, size: usize, commit: usize) -> Result<Self, Error> {
        let user_rw = Protection::READ | Protection::WRITE | Protection::USER;
        let commit = commit.min(size);
        let base = memory
            .map(None, size, MapFlags::RESERVE, user_rw)
            .ok_or(Error::OutOfMemory)?;
        let top = base + size as u64;
        let limit = base + (size - commit) as u64;

        if commit > 0 && memory.map(Some(limit), commit, MapFlags::COMMIT, user_rw).is_none() {
            memory.unmap(base, size);
            return Err(Error::OutOfMemory);
        }

        let guarded = size - commit;
        if guarded > 0
            && memory
                .map(Some(base), guarded, MapFlags::COMMIT, user_rw | Protection::GUARD)
                .is_none()
        {
            memory.unmap(base, size);
            return Err(Error::OutOfMemory);
        }

        Ok(UserStack { base, top, limit })
    }

    /// Returns the lowest address of the stack.
    ///
    pub fn base(&self) -> VirtAddr {
        self.base
    }

    /// Returns the initial stack pointer.
    ///
    pub fn top(&self) -> VirtAddr {
        self.top
    }

    /// Returns the lowest committed address.
    ///
    pub fn limit(&self) -> VirtAddr {
        self.limit
    }

    /// Returns the number of bytes reserved.
    ///
    pub fn size(&self) -> usize {
        (self.top - self.base) as usize
    }
}

/// The user-mode resources owned by a user thread.
///
#[derive(Debug)]
pub struct UserContext {
    tib: VirtAddr,
    entry_point: VirtAddr,
    stack: Option<UserStack>,
}

impl UserContext {
    /// Maps and fills in a thread information block for
    /// thread `tid`, then allocates its user stack.
    ///
    /// If any step fails, everything allocated so far
    /// is released.
    ///
    pub fn allocate(
        memory: &dyn MemoryManager,
        tid: ThreadId,
        entry_point: VirtAddr,
        stack_size: usize,
        stack_commit: usize,
    ) -> Result<Self, Error> {
        let tib = memory
            .map(
                None,
                size_of::<ThreadInfo>(),
                MapFlags::RESERVE | MapFlags::COMMIT,
                Protection::READ | Protection::WRITE | Protection::USER,
            )
            .ok_or(Error::OutOfMemory)?;

        let info: *mut ThreadInfo = tib.as_mut_ptr();
        unsafe {
            info.write(ThreadInfo {
                self_ptr: tib.as_u64(),
                tls_base: tib.as_u64() + (size_of::<ThreadInfo>() - TLS_SLOTS * 8) as u64,
                stack_base: 0,
                stack_top: 0,
                stack_limit: 0,
                tid: tid.as_u64(),
                pid: PROCESS_ID,
                tls: [0; TLS_SLOTS],
            });
        }

        let mut context = UserContext {
            tib,
            entry_point,
            stack: None,
        };

        match UserStack::allocate(memory, stack_size, stack_commit) {
            Ok(stack) => {
                unsafe {
                    (*info).stack_base = stack.base().as_u64();
                    (*info).stack_top = stack.top().as_u64();
                    (*info).stack_limit = stack.limit().as_u64();
                }

                context.stack = Some(stack);
                Ok(context)
            }
            Err(err) => {
                context.release(memory);
                Err(err)
            }
        }
    }

    /// Returns the address of the thread information
    /// block.
    ///
    pub fn tib(&self) -> VirtAddr {
        self.tib
    }

    /// Returns the user-mode entry point.
    ///
    pub fn entry_point(&self) -> VirtAddr {
        self.entry_point
    }

    /// Returns the user stack.
    ///
    pub fn stack(&self) -> Option<UserStack> {
        self.stack
    }

    /// Unmaps the user stack and the thread information
    /// block.
    ///
    pub fn release(self, memory: &dyn MemoryManager) {
        if let Some(stack) = self.stack {
            memory.unmap(stack.base(), stack.size());
        }

        memory.unmap(self.tib, size_of::<ThreadInfo>());
    }
}

// The TIB must fit in the single page mapped for it.
const _: () = assert!(size_of::<ThreadInfo>() <= PAGE_SIZE);
