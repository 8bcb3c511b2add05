// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Defines the errors returned by scheduler operations.

use core::fmt;

/// Describes why a scheduler operation failed.
///
/// Violated invariants, such as the idle thread
/// trying to exit, are not errors and result in a
/// panic instead.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Memory or handles ran out while creating a
    /// thread or task queue.
    OutOfMemory,

    /// The task is already waiting in a task queue.
    AlreadyQueued,

    /// The task queue has reached its maximum size.
    CapacityExceeded,
}

impl Error {
    /// Returns the numerical error code used by the
    /// kernel's syscall interface.
    ///
    pub const fn errno(self) -> i32 {
        match self {
            Error::OutOfMemory => 12,
            Error::AlreadyQueued => 16,
            Error::CapacityExceeded => 11,
        }
    }

    /// Returns the error with the given numerical
    /// code, if any.
    ///
    pub const fn from_errno(errno: i32) -> Option<Self> {
        match errno {
            12 => Some(Error::OutOfMemory),
            16 => Some(Error::AlreadyQueued),
            11 => Some(Error::CapacityExceeded),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::AlreadyQueued => write!(f, "task already queued"),
            Error::CapacityExceeded => write!(f, "task queue full"),
        }
    }
}
