// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements preemptive multitasking, using independent threads of execution.
//!
//! ## Shared state
//!
//! All scheduler state lives in a single [`Scheduler`], which the kernel
//! creates once with [`init`] and reaches afterwards with [`scheduler`].
//! This includes the set of threads, the ready queues, the deferred
//! procedure call stack, and the system task queue.
//!
//! ## Preemptive multitasking
//!
//! The [`thread`] module implements threads, each of which has its own
//! kernel stack and execution state. Threads are selected by strict
//! priority, in FIFO order within each [`Priority`](thread::Priority) level.
//! The kernel's clock interrupt calls [`Scheduler::request_reschedule`]
//! and then [`Scheduler::preempt`] at interrupt exit, which switches to
//! the best ready thread.
//!
//! ## Deferred work
//!
//! Interrupt handlers push [`Dpc`](dpc::Dpc)s, which run at the next
//! dispatch or idle tick. Work that needs a thread context is submitted
//! to a [`TaskQueue`](taskqueue::TaskQueue), each of which is drained by
//! its own worker thread.
//!
//! ## Hardware access
//!
//! Everything that touches the CPU goes through the
//! [`Machine`](machine::Machine) trait, and memory and object handles go
//! through the collaborator traits in [`memory`] and [`objects`]. On bare
//! metal x86-64, [`X86Machine`](machine::X86Machine) provides the real
//! implementation.

#![cfg_attr(not(test), no_std)]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![allow(clippy::panic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod config;
pub mod dpc;
pub mod error;
pub mod machine;
pub mod memory;
pub mod objects;
pub mod scheduler;
mod switch;
pub mod taskqueue;
pub mod thread;
mod work;

#[cfg(test)]
mod testing;

pub use crate::config::Config;
pub use crate::error::Error;
pub use crate::objects::Platform;
pub use crate::scheduler::Scheduler;
pub use crate::work::{DeferredFn, WorkState};

use spin::Once;

/// SCHEDULER is the kernel's scheduler.
///
static SCHEDULER: Once<Scheduler> = Once::new();

/// Creates the kernel's scheduler.
///
/// The calling thread becomes the idle thread, which
/// keeps running until it calls [`Scheduler::start`].
///
/// # Panics
///
/// `init` will panic if the scheduler has already been
/// initialised.
///
pub fn init(platform: Platform, config: Config) -> Result<&'static Scheduler, Error> {
    if SCHEDULER.is_completed() {
        panic!("multitasking::init() called more than once");
    }

    let scheduler = Scheduler::new(platform, config)?;
    Ok(SCHEDULER.call_once(|| scheduler))
}

/// Returns the kernel's scheduler.
///
/// # Panics
///
/// `scheduler` will panic if called before [`init`].
///
pub fn scheduler() -> &'static Scheduler {
    match SCHEDULER.get() {
        Some(scheduler) => scheduler,
        None => panic!("multitasking::scheduler() called before multitasking::init()"),
    }
}
