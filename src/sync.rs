//! Settle-once notifications.
//!
//! [`Completion`] is the crate's promise: it is settled at most once, any number
//! of tasks may wait on it, and every waiter observes a clone of the same value.
//! Later attempts to settle it are ignored and reported to the caller.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;
use smallvec::SmallVec;

struct State<T> {
    value: Option<T>,
    waiters: SmallVec<[Waker; 2]>,
}

/// A value that becomes available exactly once.
pub struct Completion<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Completion<T> {
    /// Creates an unsettled completion.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                value: None,
                waiters: SmallVec::new(),
            })),
        }
    }

    /// Creates a completion that is already settled with `value`.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                value: Some(value),
                waiters: SmallVec::new(),
            })),
        }
    }

    /// Settles the completion. Returns `false` if it was already settled.
    pub fn complete(&self, value: T) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            if state.value.is_some() {
                return false;
            }
            state.value = Some(value);
            std::mem::take(&mut state.waiters)
        };
        for waker in waiters {
            waker.wake();
        }
        true
    }

    /// Returns `true` once settled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state.lock().value.is_some()
    }

    /// Returns `true` if both handles share the same underlying state.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.state, &b.state)
    }
}

impl<T: Clone> Completion<T> {
    /// Returns the settled value without waiting.
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    /// Returns a future resolving to the settled value.
    #[must_use]
    pub fn wait(&self) -> Wait<T> {
        Wait {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Completion")
            .field("complete", &state.value.is_some())
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

/// Future returned by [`Completion::wait`].
#[must_use = "futures do nothing unless polled"]
pub struct Wait<T> {
    state: Arc<Mutex<State<T>>>,
}

impl<T: Clone> Future for Wait<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.lock();
        if let Some(value) = &state.value {
            return Poll::Ready(value.clone());
        }
        if !state.waiters.iter().any(|w| w.will_wake(cx.waker())) {
            state.waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for Wait<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait").finish_non_exhaustive()
    }
}
