//! Task storage for the cooperative scheduler.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Wake};

use parking_lot::Mutex;

use super::ReadyQueue;

/// A type-erased spawned future.
pub(crate) struct LocalTask {
    future: Pin<Box<dyn Future<Output = ()>>>,
}

impl LocalTask {
    pub(crate) fn new<F>(future: F) -> Self
    where
        F: Future<Output = ()> + 'static,
    {
        Self {
            future: Box::pin(future),
        }
    }

    pub(crate) fn poll(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        self.future.as_mut().poll(cx)
    }
}

impl fmt::Debug for LocalTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTask").finish_non_exhaustive()
    }
}

/// Waker for one task slot.
///
/// `scheduled` dedupes wakes: a task sits in the ready queue at most once.
pub(crate) struct TaskWaker {
    pub(crate) key: usize,
    pub(crate) scheduled: AtomicBool,
    pub(crate) queue: Arc<ReadyQueue>,
}

impl TaskWaker {
    pub(crate) fn new(key: usize, queue: Arc<ReadyQueue>) -> Self {
        Self {
            key,
            scheduled: AtomicBool::new(false),
            queue,
        }
    }
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            self.queue.push(self.key);
        }
    }
}

struct JoinState<T> {
    output: Option<T>,
    waker: Option<std::task::Waker>,
}

/// Handle to the output of a spawned task.
#[must_use = "dropping a JoinHandle detaches the task"]
pub struct JoinHandle<T> {
    state: Arc<Mutex<JoinState<T>>>,
}

impl<T> JoinHandle<T> {
    pub(crate) fn pair() -> (Self, JoinSender<T>) {
        let state = Arc::new(Mutex::new(JoinState {
            output: None,
            waker: None,
        }));
        (
            Self {
                state: Arc::clone(&state),
            },
            JoinSender { state },
        )
    }

    /// Returns `true` once the task has produced its output.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().output.is_some()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut state = self.state.lock();
        match state.output.take() {
            Some(output) => Poll::Ready(output),
            None => {
                state.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("finished", &self.is_finished())
            .finish()
    }
}

pub(crate) struct JoinSender<T> {
    state: Arc<Mutex<JoinState<T>>>,
}

impl<T> JoinSender<T> {
    pub(crate) fn send(self, output: T) {
        let waker = {
            let mut state = self.state.lock();
            state.output = Some(output);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::task::Waker;

    struct NoopWaker;

    impl Wake for NoopWaker {
        fn wake(self: Arc<Self>) {}
    }

    #[test]
    fn local_task_accepts_non_send_futures() {
        crate::test_utils::init_test_logging();
        let hits = Rc::new(Cell::new(0));
        let seen = Rc::clone(&hits);
        let mut task = LocalTask::new(async move {
            seen.set(seen.get() + 1);
        });
        let waker = Waker::from(Arc::new(NoopWaker));
        let mut cx = Context::from_waker(&waker);
        assert!(task.poll(&mut cx).is_ready());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn task_waker_queues_key_once() {
        crate::test_utils::init_test_logging();
        let queue = Arc::new(ReadyQueue::default());
        let waker = Arc::new(TaskWaker::new(3, Arc::clone(&queue)));
        Waker::from(Arc::clone(&waker)).wake_by_ref();
        Waker::from(Arc::clone(&waker)).wake();
        assert_eq!(queue.drain(), vec![3]);
        waker.scheduled.store(false, Ordering::Release);
        Waker::from(waker).wake();
        assert_eq!(queue.drain(), vec![3]);
    }

    #[test]
    fn join_handle_yields_sent_output() {
        crate::test_utils::init_test_logging();
        let (mut handle, sender) = JoinHandle::pair();
        let waker = Waker::from(Arc::new(NoopWaker));
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut handle).poll(&mut cx).is_pending());
        sender.send("out");
        assert!(handle.is_finished());
        assert_eq!(Pin::new(&mut handle).poll(&mut cx), Poll::Ready("out"));
    }
}
