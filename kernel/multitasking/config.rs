// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains the tunable parameters of the scheduler.

use crate::thread::Priority;
use x86_64::structures::paging::{PageSize, Size4KiB};

/// The size of a page of memory, in bytes.
///
pub const PAGE_SIZE: usize = Size4KiB::SIZE as usize;

/// The number of pages in each kernel stack.
///
pub const KERNEL_STACK_PAGES: usize = 4;

/// The amount of user stack reserved when a
/// user thread is created with a stack size of
/// zero.
///
pub const DEFAULT_USER_STACK_SIZE: usize = 1024 * 1024; // 1 MiB.

/// Parameters used by [`Scheduler`](crate::Scheduler).
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// The number of pages in each kernel stack.
    pub kernel_stack_pages: usize,

    /// The user stack reserved for user threads
    /// created with a stack size of zero.
    pub default_user_stack_size: usize,

    /// The number of bytes at the top of each user
    /// stack that are committed up front. The rest
    /// of the stack is committed as guard pages.
    pub user_stack_commit: usize,

    /// The priority of the system task queue's
    /// worker thread.
    pub system_task_priority: Priority,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            kernel_stack_pages: KERNEL_STACK_PAGES,
            default_user_stack_size: DEFAULT_USER_STACK_SIZE,
            user_stack_commit: PAGE_SIZE,
            system_task_priority: Priority::System,
        }
    }
}

impl Config {
    /// Returns the size of each kernel stack, in
    /// bytes.
    ///
    pub const fn kernel_stack_size(&self) -> usize {
        self.kernel_stack_pages * PAGE_SIZE
    }

    /// Returns the user stack size to reserve for
    /// a requested size of `requested` bytes.
    ///
    /// Zero selects the default size. Any other size
    /// is rounded up to a whole number of pages.
    ///
    pub const fn user_stack_size(&self, requested: usize) -> usize {
        if requested == 0 {
            self.default_user_stack_size
        } else {
            ((requested + PAGE_SIZE - 1) / PAGE_SIZE) * PAGE_SIZE
        }
    }
}
