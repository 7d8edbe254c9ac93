//! Lock ownership and orderly release.
//!
//! A push-facing adapter owns the reader and writer locks it acquired on the
//! wrapped pull streams. [`LockLease`] makes releasing them an exactly-once
//! operation no matter how many teardown paths race for it, and
//! [`PendingOperation`] tracks the single outstanding read or write so a
//! release can wait for it to settle.
//!
//! [`release_in_order`] is the release sequence itself:
//!
//! ```text
//! writer ready -> flush (push stream finished) -> release writer
//!             -> pending read settled        -> release reader
//! ```
//!
//! Writer-side release completes before reader-side release begins. A failure
//! on one side is reported but does not stop the other side from releasing.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, ready};

use parking_lot::Mutex;
use pin_project::pin_project;

use crate::error::{BridgeError, LockSide, OperationKind, StreamError};
use crate::pull::{ReadableReader, WritableWriter};
use crate::sync::{Completion, Wait};
use crate::tracing_compat::{debug, trace};

type Outcome = Completion<Option<StreamError>>;

/// The single outstanding operation of one kind.
///
/// [`begin`](Self::begin) fails with [`BridgeError::OperationInProgress`] while
/// a previous operation is unsettled.
pub struct PendingOperation {
    kind: OperationKind,
    current: Mutex<Option<Outcome>>,
}

impl PendingOperation {
    /// Creates a tracker with nothing outstanding.
    #[must_use]
    pub fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            current: Mutex::new(None),
        }
    }

    /// Kind of operation tracked.
    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Returns `true` while an operation is outstanding.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|outcome| !outcome.is_complete())
    }

    /// Marks an operation as outstanding until the guard settles or drops.
    pub fn begin(&self) -> Result<OperationGuard, BridgeError> {
        let mut current = self.current.lock();
        if current
            .as_ref()
            .is_some_and(|outcome| !outcome.is_complete())
        {
            return Err(BridgeError::OperationInProgress(self.kind));
        }
        let outcome = Completion::new();
        *current = Some(outcome.clone());
        Ok(OperationGuard { outcome })
    }

    /// Wraps `future` so the operation settles with its result.
    pub fn track<F>(&self, future: F) -> Result<Tracked<F>, BridgeError> {
        let guard = self.begin()?;
        Ok(Tracked {
            future,
            guard: Some(guard),
        })
    }

    /// Resolves once nothing is outstanding, with the last operation's error.
    pub fn settled(&self) -> Wait<Option<StreamError>> {
        match &*self.current.lock() {
            Some(outcome) => outcome.wait(),
            None => Completion::resolved(None).wait(),
        }
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("kind", &self.kind)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Keeps an operation outstanding. Dropping it settles the operation without
/// an error.
#[derive(Debug)]
pub struct OperationGuard {
    outcome: Outcome,
}

impl OperationGuard {
    /// Settles the operation with `error`.
    pub fn complete(self, error: Option<StreamError>) {
        self.outcome.complete(error);
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.outcome.complete(None);
    }
}

/// Future returned by [`PendingOperation::track`].
#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct Tracked<F> {
    #[pin]
    future: F,
    guard: Option<OperationGuard>,
}

impl<F, T> Future for Tracked<F>
where
    F: Future<Output = Result<T, StreamError>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = ready!(this.future.poll(cx));
        if let Some(guard) = this.guard.take() {
            guard.complete(output.as_ref().err().cloned());
        }
        Poll::Ready(output)
    }
}

/// A reader or writer lock that can be given back.
pub trait ReleasableLock {
    /// Which side this lock belongs to.
    const SIDE: LockSide;

    /// Gives the lock back to its stream.
    fn release_lock(&self) -> Result<(), BridgeError>;
}

impl ReleasableLock for ReadableReader {
    const SIDE: LockSide = LockSide::Reader;

    fn release_lock(&self) -> Result<(), BridgeError> {
        Self::release_lock(self)
    }
}

impl ReleasableLock for WritableWriter {
    const SIDE: LockSide = LockSide::Writer;

    fn release_lock(&self) -> Result<(), BridgeError> {
        Self::release_lock(self)
    }
}

/// Exclusive ownership of an acquired lock, released at most once.
pub struct LockLease<L> {
    lock: L,
    released: AtomicBool,
}

impl<L: ReleasableLock> LockLease<L> {
    /// Takes ownership of an acquired lock.
    pub const fn new(lock: L) -> Self {
        Self {
            lock,
            released: AtomicBool::new(false),
        }
    }

    /// The lock, unless it has been released.
    #[must_use]
    pub fn get(&self) -> Option<&L> {
        (!self.is_released()).then_some(&self.lock)
    }

    /// Returns `true` once [`release`](Self::release) ran.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Releases the lock. Returns `Ok(false)` if it was already released.
    ///
    /// A failing release still counts as released; it is never retried.
    pub fn release(&self) -> Result<bool, BridgeError> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        let side = L::SIDE;
        trace!(%side, "releasing lock");
        self.lock
            .release_lock()
            .map(|()| true)
            .map_err(|err| BridgeError::LockRelease {
                side,
                source: err.into(),
            })
    }
}

impl<L> fmt::Debug for LockLease<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockLease")
            .field("released", &self.released.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// Waits for an outstanding read to settle.
///
/// A read rejected because the lock was released is a normal outcome; any other
/// failure is reported as [`BridgeError::UpstreamRead`].
pub async fn wait_for_pending_read_to_settle(pending: &PendingOperation) -> Result<(), BridgeError> {
    match pending.settled().await {
        Some(err) if !err.is_released() => Err(BridgeError::UpstreamRead(err)),
        _ => Ok(()),
    }
}

/// Waits until the writer reports readiness.
///
/// Returns at once if the lease was already released.
pub async fn wait_for_writer_ready(writer: &LockLease<WritableWriter>) -> Result<(), BridgeError> {
    let Some(lock) = writer.get() else {
        return Ok(());
    };
    match lock.ready().await {
        Err(err) if !err.is_released() => Err(BridgeError::UpstreamWrite(err)),
        _ => Ok(()),
    }
}

/// Runs the release sequence. Returns the first failure seen.
pub async fn release_in_order<F>(
    writer: Option<&LockLease<WritableWriter>>,
    flush: F,
    reader: Option<(&LockLease<ReadableReader>, &PendingOperation)>,
) -> Result<(), BridgeError>
where
    F: Future<Output = Result<(), StreamError>>,
{
    let mut first: Option<BridgeError> = None;
    let mut note = |outcome: Result<(), BridgeError>| {
        if let Err(err) = outcome {
            debug!(error = %err, "release step failed");
            first.get_or_insert(err);
        }
    };

    if let Some(writer) = writer {
        note(wait_for_writer_ready(writer).await);
        note(match flush.await {
            Err(err) if !is_teardown(&err) => Err(BridgeError::UpstreamWrite(err)),
            _ => Ok(()),
        });
        note(writer.release().map(drop));
    }

    if let Some((reader, pending)) = reader {
        note(wait_for_pending_read_to_settle(pending).await);
        note(reader.release().map(drop));
    }

    first.map_or(Ok(()), Err)
}

fn is_teardown(err: &StreamError) -> bool {
    matches!(
        err.as_bridge(),
        Some(BridgeError::Destroyed | BridgeError::Released)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadableMode;
    use crate::pull::{CollectSink, ReadableStream, UnderlyingSource, WritableStream};
    use crate::runtime::{self, try_block_on};
    use std::sync::Arc;

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    struct Idle;
    impl UnderlyingSource for Idle {}

    #[test]
    fn second_begin_is_rejected_until_settled() {
        init_test("second_begin_is_rejected_until_settled");
        let pending = PendingOperation::new(OperationKind::Read);
        let guard = pending.begin().expect("first");
        let second = pending.begin().expect_err("second");
        crate::assert_with_log!(
            matches!(second, BridgeError::OperationInProgress(OperationKind::Read)),
            "second begin",
            "OperationInProgress(read)",
            second
        );
        drop(guard);
        assert!(!pending.is_pending());
        assert!(pending.begin().is_ok());
        crate::test_complete!("second_begin_is_rejected_until_settled");
    }

    #[test]
    fn tracked_future_settles_with_its_error() {
        init_test("tracked_future_settles_with_its_error");
        let pending = PendingOperation::new(OperationKind::Write);
        let cause = StreamError::msg("sink gone");
        let failing = cause.clone();
        let tracked = pending
            .track(async move { Err::<(), _>(failing) })
            .expect("track");
        assert!(pending.is_pending());
        let outcome = try_block_on(tracked).expect("settles");
        assert!(StreamError::same(&outcome.expect_err("fails"), &cause));
        let settled = try_block_on(pending.settled()).expect("settled");
        assert!(StreamError::same(&settled.expect("error kept"), &cause));
        crate::test_complete!("tracked_future_settles_with_its_error");
    }

    #[test]
    fn lease_releases_exactly_once() {
        init_test("lease_releases_exactly_once");
        let stream = ReadableStream::new(Idle, ReadableMode::Default);
        let lease = LockLease::new(stream.get_reader().expect("reader"));
        assert!(lease.get().is_some());
        assert!(lease.release().expect("first release"));
        assert!(!lease.release().expect("second release is a no-op"));
        assert!(lease.get().is_none());
        assert!(!stream.is_locked());
        crate::test_complete!("lease_releases_exactly_once");
    }

    #[test]
    fn lease_reports_foreign_release_as_lock_release_error() {
        init_test("lease_reports_foreign_release_as_lock_release_error");
        let stream = ReadableStream::new(Idle, ReadableMode::Default);
        let reader = stream.get_reader().expect("reader");
        let lease = LockLease::new(reader.clone());
        reader.release_lock().expect("released behind the lease");
        let err = lease.release().expect_err("already gone");
        assert!(matches!(
            err,
            BridgeError::LockRelease {
                side: LockSide::Reader,
                ..
            }
        ));
        assert!(lease.is_released());
        crate::test_complete!("lease_reports_foreign_release_as_lock_release_error");
    }

    #[test]
    fn release_in_order_drops_writer_before_reader() {
        init_test("release_in_order_drops_writer_before_reader");
        let readable = ReadableStream::new(Idle, ReadableMode::Default);
        let writable = WritableStream::new(CollectSink::new(), 1);
        let reader = LockLease::new(readable.get_reader().expect("reader"));
        let writer = LockLease::new(writable.get_writer().expect("writer"));
        let pending = PendingOperation::new(OperationKind::Read);
        let guard = pending.begin().expect("read outstanding");

        let order = Arc::new(Mutex::new(Vec::new()));
        let flushed = Arc::clone(&order);
        let check_writable = writable.clone();
        let check_readable = readable.clone();
        let handle = runtime::spawn({
            let order = Arc::clone(&order);
            async move {
                let outcome = release_in_order(
                    Some(&writer),
                    async move {
                        flushed.lock().push("flush");
                        Ok(())
                    },
                    Some((&reader, &pending)),
                )
                .await;
                order.lock().push("done");
                outcome
            }
        });
        runtime::run_until_stalled();
        // The reader waits for the outstanding read; the writer is already free.
        assert!(!check_writable.is_locked());
        assert!(check_readable.is_locked());
        assert_eq!(*order.lock(), ["flush"]);

        drop(guard);
        let outcome = try_block_on(handle).expect("release finishes");
        assert!(outcome.is_ok());
        assert!(!check_readable.is_locked());
        assert_eq!(*order.lock(), ["flush", "done"]);
        crate::test_complete!("release_in_order_drops_writer_before_reader");
    }

    #[test]
    fn read_failure_is_reported_but_reader_still_released() {
        init_test("read_failure_is_reported_but_reader_still_released");
        let readable = ReadableStream::new(Idle, ReadableMode::Default);
        let reader = LockLease::new(readable.get_reader().expect("reader"));
        let pending = PendingOperation::new(OperationKind::Read);
        let cause = StreamError::msg("read blew up");
        pending.begin().expect("begin").complete(Some(cause.clone()));
        let outcome = try_block_on(release_in_order(
            None,
            async { Ok(()) },
            Some((&reader, &pending)),
        ))
        .expect("settles");
        match outcome {
            Err(BridgeError::UpstreamRead(err)) => assert!(StreamError::same(&err, &cause)),
            other => panic!("expected upstream read error, got {other:?}"),
        }
        assert!(!readable.is_locked());
        crate::test_complete!("read_failure_is_reported_but_reader_still_released");
    }
}
