// Copyright 2021 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Holds the threads waiting to run, one FIFO per priority level.

use crate::thread::{Priority, Thread};
use alloc::collections::VecDeque;
use alloc::sync::Arc;

/// ReadyQueues holds one queue of ready threads for
/// each priority level.
///
pub(crate) struct ReadyQueues {
    levels: [VecDeque<Arc<Thread>>; Priority::LEVELS],
}

impl ReadyQueues {
    pub fn new() -> Self {
        ReadyQueues {
            levels: core::array::from_fn(|_| VecDeque::new()),
        }
    }

    /// push adds a thread to the tail of its priority
    /// level.
    ///
    pub fn push(&mut self, thread: Arc<Thread>) {
        self.levels[thread.priority().level()].push_back(thread);
    }

    /// pop_highest removes and returns the thread at the
    /// head of the highest non-empty priority level.
    ///
    pub fn pop_highest(&mut self) -> Option<Arc<Thread>> {
        self.levels
            .iter_mut()
            .rev()
            .find_map(|level| level.pop_front())
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(|level| level.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadId;

    fn thread(id: u64, priority: Priority) -> Arc<Thread> {
        Arc::new(Thread::new(ThreadId::new(id), "test", priority, 0, None, 0))
    }

    #[test]
    fn highest_priority_first() {
        let mut queues = ReadyQueues::new();
        assert!(queues.pop_highest().is_none());

        queues.push(thread(1, Priority::Normal));
        queues.push(thread(2, Priority::Idle));
        queues.push(thread(3, Priority::TimeCritical));
        queues.push(thread(4, Priority::Normal));
        assert_eq!(queues.len(), 4);

        let order: alloc::vec::Vec<u64> =
            core::iter::from_fn(|| queues.pop_highest().map(|t| t.id().as_u64())).collect();
        assert_eq!(order, [3, 1, 4, 2]);
        assert_eq!(queues.len(), 0);
    }
}
