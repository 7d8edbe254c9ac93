//! Single-threaded cooperative scheduler.
//!
//! Every thread owns one scheduler. Work enters it three ways:
//!
//! - [`spawn`] queues a task that is polled whenever it is woken.
//! - [`defer`] queues a closure for the *next turn*: it runs only once no task is
//!   ready, after everything the current operation woke has settled.
//! - [`block_on`] drives a future on the current thread, running spawned tasks and
//!   deferred closures until it resolves.
//!
//! There is no parallelism inside a scheduler. Tasks interleave only at `.await`
//! points, which is the execution model both stream contracts assume. Wakers are
//! `Send`, so a value completed on another thread still wakes the right task.
//!
//! # Example
//!
//! ```
//! use flowbridge::runtime;
//!
//! let value = runtime::block_on(async {
//!     let handle = runtime::spawn(async { 40 + 2 });
//!     handle.await
//! });
//! assert_eq!(value, 42);
//! ```

mod task;

pub use task::JoinHandle;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};

use parking_lot::Mutex;
use slab::Slab;

use crate::tracing_compat::trace;
use task::{LocalTask, TaskWaker};

/// Queue of task keys ready to be polled, shared with wakers.
#[derive(Default)]
pub(crate) struct ReadyQueue {
    keys: Mutex<VecDeque<usize>>,
    main_woken: AtomicBool,
    parked: Mutex<Option<Thread>>,
}

impl ReadyQueue {
    pub(crate) fn push(&self, key: usize) {
        self.keys.lock().push_back(key);
        self.unpark();
    }

    pub(crate) fn drain(&self) -> Vec<usize> {
        self.keys.lock().drain(..).collect()
    }

    fn wake_main(&self) {
        self.main_woken.store(true, Ordering::Release);
        self.unpark();
    }

    fn unpark(&self) {
        if let Some(thread) = self.parked.lock().as_ref() {
            thread.unpark();
        }
    }
}

struct MainWaker {
    queue: Arc<ReadyQueue>,
}

impl Wake for MainWaker {
    fn wake(self: Arc<Self>) {
        self.queue.wake_main();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.wake_main();
    }
}

struct TaskSlot {
    task: Option<LocalTask>,
    waker: Arc<TaskWaker>,
}

type Deferred = Box<dyn FnOnce()>;

struct Scheduler {
    tasks: RefCell<Slab<TaskSlot>>,
    ready: Arc<ReadyQueue>,
    deferred: RefCell<VecDeque<Deferred>>,
}

impl Scheduler {
    fn new() -> Self {
        Self {
            tasks: RefCell::new(Slab::new()),
            ready: Arc::new(ReadyQueue::default()),
            deferred: RefCell::new(VecDeque::new()),
        }
    }
}

thread_local! {
    static SCHEDULER: Scheduler = Scheduler::new();
}

/// Spawns a task onto the current thread's scheduler.
///
/// The task makes progress only while the thread is inside [`block_on`],
/// [`try_block_on`] or [`run_until_stalled`].
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    let (handle, sender) = JoinHandle::pair();
    let task = LocalTask::new(async move {
        sender.send(future.await);
    });
    SCHEDULER.with(|sched| {
        let mut tasks = sched.tasks.borrow_mut();
        let entry = tasks.vacant_entry();
        let key = entry.key();
        let waker = Arc::new(TaskWaker::new(key, Arc::clone(&sched.ready)));
        waker.scheduled.store(true, Ordering::Release);
        entry.insert(TaskSlot {
            task: Some(task),
            waker,
        });
        sched.ready.push(key);
        trace!(task = key, "task spawned");
    });
    handle
}

/// Runs `f` on the next scheduler turn, after all currently ready tasks settle.
pub fn defer<F>(f: F)
where
    F: FnOnce() + 'static,
{
    SCHEDULER.with(|sched| {
        sched.deferred.borrow_mut().push_back(Box::new(f));
        sched.ready.unpark();
    });
}

fn poll_task(key: usize) {
    let claimed = SCHEDULER.with(|sched| {
        let mut tasks = sched.tasks.borrow_mut();
        let slot = tasks.get_mut(key)?;
        slot.waker.scheduled.store(false, Ordering::Release);
        let task = slot.task.take()?;
        Some((task, Arc::clone(&slot.waker)))
    });
    let Some((mut task, waker)) = claimed else {
        return;
    };
    let waker = Waker::from(waker);
    let mut cx = Context::from_waker(&waker);
    let finished = task.poll(&mut cx).is_ready();
    SCHEDULER.with(|sched| {
        let mut tasks = sched.tasks.borrow_mut();
        if finished {
            if tasks.contains(key) {
                tasks.remove(key);
            }
            trace!(task = key, "task finished");
        } else if let Some(slot) = tasks.get_mut(key) {
            slot.task = Some(task);
        }
    });
}

/// Runs one scheduler turn. Returns `false` if there was nothing to do.
///
/// A turn polls a snapshot of the ready queue; deferred closures run only on a
/// turn where no task was ready.
fn turn() -> bool {
    let ready = SCHEDULER.with(|sched| sched.ready.drain());
    if !ready.is_empty() {
        for key in ready {
            poll_task(key);
        }
        return true;
    }
    let deferred: Vec<Deferred> =
        SCHEDULER.with(|sched| sched.deferred.borrow_mut().drain(..).collect());
    if deferred.is_empty() {
        return false;
    }
    for f in deferred {
        f();
    }
    true
}

/// Runs spawned tasks and deferred closures until none can make progress.
pub fn run_until_stalled() {
    while turn() {}
}

fn main_waker() -> (Waker, Arc<ReadyQueue>) {
    let queue = SCHEDULER.with(|sched| Arc::clone(&sched.ready));
    queue.main_woken.store(true, Ordering::Release);
    let waker = Waker::from(Arc::new(MainWaker {
        queue: Arc::clone(&queue),
    }));
    (waker, queue)
}

/// Drives `future` to completion on the current thread.
///
/// The thread parks while nothing is runnable and resumes when any waker fires,
/// including wakers invoked from other threads.
pub fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = pin!(future);
    let (waker, queue) = main_waker();
    *queue.parked.lock() = Some(thread::current());
    let mut cx = Context::from_waker(&waker);
    let output = loop {
        if queue.main_woken.swap(false, Ordering::AcqRel) {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                break output;
            }
        }
        if turn() || queue.main_woken.load(Ordering::Acquire) {
            continue;
        }
        thread::park();
    };
    *queue.parked.lock() = None;
    output
}

/// Drives `future` until it resolves or the scheduler stalls.
///
/// Returns `None` if every task is blocked and nothing is deferred, which makes
/// hangs observable in tests instead of parking forever.
pub fn try_block_on<F: Future>(future: F) -> Option<F::Output> {
    let mut future = pin!(future);
    let (waker, queue) = main_waker();
    let mut cx = Context::from_waker(&waker);
    loop {
        if queue.main_woken.swap(false, Ordering::AcqRel) {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Some(output);
            }
        }
        if turn() || queue.main_woken.load(Ordering::Acquire) {
            continue;
        }
        return None;
    }
}

/// Future that yields once, letting every other ready task run first.
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Yields back to the scheduler.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future that resolves on the next scheduler turn.
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct NextTurn {
    fired: Option<Arc<AtomicBool>>,
}

impl Future for NextTurn {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match &self.fired {
            Some(fired) if fired.load(Ordering::Acquire) => Poll::Ready(()),
            Some(_) => Poll::Pending,
            None => {
                let fired = Arc::new(AtomicBool::new(false));
                let flag = Arc::clone(&fired);
                let waker = cx.waker().clone();
                defer(move || {
                    flag.store(true, Ordering::Release);
                    waker.wake();
                });
                self.fired = Some(fired);
                Poll::Pending
            }
        }
    }
}

/// Waits until the scheduler has drained its ready queue once.
pub fn next_turn() -> NextTurn {
    NextTurn { fired: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn block_on_runs_spawned_tasks() {
        init_test("block_on_runs_spawned_tasks");
        let value = block_on(async {
            let a = spawn(async { 1 });
            let b = spawn(async { 2 });
            a.await + b.await
        });
        crate::assert_with_log!(value == 3, "joined sum", 3, value);
        crate::test_complete!("block_on_runs_spawned_tasks");
    }

    #[test]
    fn deferred_runs_after_ready_tasks() {
        init_test("deferred_runs_after_ready_tasks");
        let log = Rc::new(RefCell::new(Vec::new()));
        let deferred_log = Rc::clone(&log);
        defer(move || deferred_log.borrow_mut().push("deferred"));
        let task_log = Rc::clone(&log);
        let _task = spawn(async move {
            task_log.borrow_mut().push("task-1");
            yield_now().await;
            task_log.borrow_mut().push("task-2");
        });
        run_until_stalled();
        assert_eq!(*log.borrow(), vec!["task-1", "task-2", "deferred"]);
        crate::test_complete!("deferred_runs_after_ready_tasks");
    }

    #[test]
    fn yield_now_lets_peers_run() {
        init_test("yield_now_lets_peers_run");
        let log = Rc::new(RefCell::new(Vec::new()));
        let a_log = Rc::clone(&log);
        let b_log = Rc::clone(&log);
        let _a = spawn(async move {
            a_log.borrow_mut().push("a1");
            yield_now().await;
            a_log.borrow_mut().push("a2");
        });
        let _b = spawn(async move {
            b_log.borrow_mut().push("b1");
        });
        run_until_stalled();
        assert_eq!(*log.borrow(), vec!["a1", "b1", "a2"]);
        crate::test_complete!("yield_now_lets_peers_run");
    }

    #[test]
    fn next_turn_waits_for_ready_queue() {
        init_test("next_turn_waits_for_ready_queue");
        let log = Rc::new(RefCell::new(Vec::new()));
        let waiter_log = Rc::clone(&log);
        let _waiter = spawn(async move {
            next_turn().await;
            waiter_log.borrow_mut().push("after-turn");
        });
        let busy_log = Rc::clone(&log);
        let _busy = spawn(async move {
            for _ in 0..3 {
                busy_log.borrow_mut().push("busy");
                yield_now().await;
            }
        });
        run_until_stalled();
        assert_eq!(*log.borrow(), vec!["busy", "busy", "busy", "after-turn"]);
        crate::test_complete!("next_turn_waits_for_ready_queue");
    }

    #[test]
    fn try_block_on_reports_stall() {
        init_test("try_block_on_reports_stall");
        let never = crate::sync::Completion::<()>::new();
        let outcome = try_block_on(never.wait());
        crate::assert_with_log!(outcome.is_none(), "stalled", true, outcome.is_none());
        let ready = try_block_on(async { 5 });
        assert_eq!(ready, Some(5));
        crate::test_complete!("try_block_on_reports_stall");
    }

    #[test]
    fn cross_thread_wake_unparks_block_on() {
        init_test("cross_thread_wake_unparks_block_on");
        let done = crate::sync::Completion::new();
        let remote = done.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            remote.complete(9u8);
        });
        let value = block_on(done.wait());
        worker.join().expect("worker");
        assert_eq!(value, 9);
        crate::test_complete!("cross_thread_wake_unparks_block_on");
    }
}
