//! Backpressure bridge: suspend until a push stream's writes drain.
//!
//! A pull-side writer that sees `write` return `false` awaits [`drained`]. The
//! waiter records how many writes were outstanding when it registered; each write
//! the push stream completes counts every waiter down by one, and a waiter whose
//! count reaches zero resolves with `true`. Waiters resolve in registration order.
//! Destroying the stream resolves every outstanding waiter with `false`.
//!
//! Nothing here polls: the push stream's own write-completion bookkeeping drives
//! the queue.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::push::PushStream;
use crate::sync::{Completion, Wait};
use crate::tracing_compat::trace;

/// One suspended writer.
#[derive(Debug)]
pub struct DrainWaiter {
    remaining: usize,
    signal: Completion<bool>,
}

impl DrainWaiter {
    /// Writes that must still complete before this waiter resolves.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.remaining
    }
}

/// FIFO of drain waiters owned by a push stream's writable state.
#[derive(Debug, Default)]
pub struct DrainQueue {
    waiters: VecDeque<DrainWaiter>,
}

impl DrainQueue {
    /// Registers a waiter for `pending` outstanding writes.
    pub fn register(&mut self, pending: usize) -> Wait<bool> {
        let signal = Completion::new();
        let wait = signal.wait();
        if pending == 0 {
            signal.complete(true);
        } else {
            self.waiters.push_back(DrainWaiter {
                remaining: pending,
                signal,
            });
        }
        wait
    }

    /// Records one completed write.
    ///
    /// Returns the signals to settle with `true`, in registration order. The
    /// caller settles them after releasing the stream lock.
    pub fn on_write_complete(&mut self) -> SmallVec<[Completion<bool>; 2]> {
        let mut resolved = SmallVec::new();
        for waiter in &mut self.waiters {
            waiter.remaining = waiter.remaining.saturating_sub(1);
        }
        while self.waiters.front().is_some_and(|w| w.remaining == 0) {
            if let Some(waiter) = self.waiters.pop_front() {
                resolved.push(waiter.signal);
            }
        }
        // Counts decrease uniformly, so a zero behind a non-zero only happens when
        // a later waiter registered with a smaller count.
        let mut index = 0;
        while index < self.waiters.len() {
            if self.waiters[index].remaining == 0 {
                if let Some(waiter) = self.waiters.remove(index) {
                    resolved.push(waiter.signal);
                }
            } else {
                index += 1;
            }
        }
        resolved
    }

    /// Removes every waiter, returning their signals to settle with `false`.
    pub fn cancel_all(&mut self) -> SmallVec<[Completion<bool>; 2]> {
        self.waiters.drain(..).map(|w| w.signal).collect()
    }

    /// Number of suspended waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Returns `true` if nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// Outstanding writes as counted by [`drained`].
///
/// `batch` counts a non-empty queue as a single pending write, matching vectored
/// writes that flush the whole queue in one hook call.
#[must_use]
pub const fn pending_writes(queue_len: usize, writing: bool, batch: bool) -> usize {
    let queued = if batch {
        if queue_len > 0 { 1 } else { 0 }
    } else {
        queue_len
    };
    queued + if writing { 1 } else { 0 }
}

/// Suspends until `stream` has no outstanding writes.
///
/// Resolves to `true` once drained, or `false` if the stream is or becomes
/// destroyed first.
pub fn drained(stream: &PushStream, batch: bool) -> Wait<bool> {
    let id = stream.id();
    stream.with_state(|state| {
        if state.destroying {
            return Completion::resolved(false).wait();
        }
        let pending = pending_writes(state.queue.len(), state.writing, batch);
        trace!(stream = id, pending, "awaiting drain");
        state.drains.register(pending)
    })
}
