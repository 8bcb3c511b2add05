// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Tracks the queued/executing state shared by DPCs and tasks.
//!
//! A work record moves through the following states:
//!
//! | State               | queued           | dequeued                 | callback returned |
//! | ------------------- | ---------------- | ------------------------ | ----------------- |
//! | `Idle`              | `Queued`         | -                        | -                 |
//! | `Queued`            | no change        | `Executing(false)`, runs | -                 |
//! | `Executing(false)`  | `Executing(true)`| -                        | `Idle`            |
//! | `Executing(true)`   | no change        | `Executing(false)`, skip | `Queued`          |
//!
//! A record that is queued again from inside its own callback is pushed
//! a second time. If that second entry is dequeued while the callback is
//! still running, the entry is skipped, so a callback never runs nested
//! inside itself. When the callback returns, the record is left queued
//! and runs again when the remaining entry is dequeued.

use crate::scheduler::Scheduler;
use core::fmt;
use crossbeam_utils::atomic::AtomicCell;
use log::warn;
use spin::Mutex;

/// The callback type for deferred work.
///
pub type DeferredFn = fn(&Scheduler, usize);

/// Describes where a work record is in its life
/// cycle.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkState {
    /// Not in any list.
    Idle,

    /// In a list, waiting to run.
    Queued,

    /// The callback is running. If `requeued` is set,
    /// the record has been pushed onto its list again.
    Executing { requeued: bool },
}

// The state is read from any context without masking
// interrupts, so it must never fall back to a lock.
const _: () = assert!(AtomicCell::<WorkState>::is_lock_free());

/// Holds a work record's state and the callback to
/// run.
///
/// The state can be read at any time. Transitions
/// must be made with interrupts disabled.
///
pub(crate) struct WorkSlot {
    state: AtomicCell<WorkState>,
    callback: Mutex<Option<(DeferredFn, usize)>>,
}

impl WorkSlot {
    pub const fn new() -> Self {
        WorkSlot {
            state: AtomicCell::new(WorkState::Idle),
            callback: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WorkState {
        self.state.load()
    }

    /// Returns whether the record is waiting in a
    /// list.
    ///
    pub fn is_queued(&self) -> bool {
        matches!(
            self.state(),
            WorkState::Queued | WorkState::Executing { requeued: true }
        )
    }

    /// Records the callback and marks the record
    /// queued.
    ///
    /// Returns whether the caller should push the
    /// record onto its list. If the record is already
    /// queued, nothing changes.
    ///
    pub fn enqueue(&self, callback: DeferredFn, arg: usize) -> bool {
        let next = match self.state() {
            WorkState::Idle => WorkState::Queued,
            WorkState::Executing { requeued: false } => WorkState::Executing { requeued: true },
            WorkState::Queued | WorkState::Executing { requeued: true } => return false,
        };

        *self.callback.lock() = Some((callback, arg));
        self.state.store(next);
        true
    }

    /// Called when the record is removed from its
    /// list. Returns the callback to run, or `None`
    /// if the entry should be skipped.
    ///
    pub fn begin(&self) -> Option<(DeferredFn, usize)> {
        match self.state() {
            WorkState::Queued => {
                self.state.store(WorkState::Executing { requeued: false });
                *self.callback.lock()
            }
            WorkState::Executing { requeued: true } => {
                self.state.store(WorkState::Executing { requeued: false });
                None
            }
            state => {
                warn!("dequeued work record in unexpected state {:?}", state);
                None
            }
        }
    }

    /// Called when the callback returns. Returns
    /// whether the record is still queued.
    ///
    pub fn finish(&self) -> bool {
        match self.state() {
            WorkState::Executing { requeued: true } => {
                self.state.store(WorkState::Queued);
                true
            }
            _ => {
                self.state.store(WorkState::Idle);
                false
            }
        }
    }
}

impl fmt::Debug for WorkSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WorkSlot")
            .field("state", &self.state())
            .finish()
    }
}
