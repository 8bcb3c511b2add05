// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Describes the kernel services the scheduler calls but does not own.

use crate::machine::Machine;
use crate::memory::MemoryManager;
use crate::thread::Thread;
use alloc::sync::Arc;
use core::fmt;

/// Identifies a kernel object in the object table.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kernel's object table, which gives user
/// threads a handle to themselves.
///
pub trait HandleTable: Send + Sync {
    /// Allocates a handle referring to `thread`.
    ///
    fn allocate(&self, thread: &Arc<Thread>) -> Option<Handle>;

    /// Releases a handle allocated with
    /// [`allocate`](HandleTable::allocate).
    ///
    fn release(&self, handle: Handle);

    /// Returns the number of handles open on the
    /// object referenced by `handle`.
    ///
    fn handle_count(&self, handle: Handle) -> usize;
}

/// Receives notifications about thread lifetimes.
///
pub trait Debugger: Send + Sync {
    /// Called when a thread is created, with its
    /// entry point.
    ///
    fn thread_created(&self, _thread: &Thread, _entry: usize) {}

    /// Called when a thread terminates.
    ///
    fn thread_exited(&self, _thread: &Thread) {}
}

/// A [`Debugger`] that ignores every notification.
///
pub struct NoDebugger;

impl Debugger for NoDebugger {}

/// The collaborators used by a [`Scheduler`](crate::Scheduler).
///
#[derive(Clone)]
pub struct Platform {
    pub machine: Arc<dyn Machine>,
    pub memory: Arc<dyn MemoryManager>,
    pub handles: Arc<dyn HandleTable>,
    pub debugger: Arc<dyn Debugger>,
}
