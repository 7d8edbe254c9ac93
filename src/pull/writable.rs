//! Writable pull streams.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::{PullFuture, StreamState, resolved};
use crate::chunk::Chunk;
use crate::error::{BridgeError, StreamError};
use crate::runtime;
use crate::sync::{Completion, Wait};
use crate::tracing_compat::{debug, trace};

static NEXT_WRITABLE_ID: AtomicU64 = AtomicU64::new(1);

type Signal = Completion<Result<(), StreamError>>;

/// Consumer behind a [`WritableStream`].
pub trait UnderlyingSink: Send + Sync + 'static {
    /// Called once at construction; writes wait for it.
    fn start(&self) -> PullFuture {
        resolved()
    }

    /// Consumes one chunk. Never called while a previous write is pending.
    fn write(&self, chunk: Vec<u8>) -> PullFuture;

    /// Called once after every queued write has completed.
    fn close(&self) -> PullFuture {
        resolved()
    }

    /// Called when the producer abandons the stream.
    fn abort(&self, reason: Option<StreamError>) -> PullFuture {
        let _ = reason;
        resolved()
    }
}

struct WriterSlot {
    id: u64,
    closed: Signal,
}

struct State {
    status: StreamState,
    queue: VecDeque<(Vec<u8>, Signal)>,
    in_flight: bool,
    started: bool,
    close_requested: bool,
    close_signal: Option<Signal>,
    backpressure: bool,
    ready: Signal,
    writer: Option<WriterSlot>,
    next_writer: u64,
}

enum Job {
    Write(Vec<u8>, Signal),
    Close(Signal),
}

struct Inner {
    id: u64,
    high_water_mark: usize,
    sink: Arc<dyn UnderlyingSink>,
    state: Mutex<State>,
}

impl Inner {
    fn desired_size(&self, state: &State) -> Option<isize> {
        match state.status {
            StreamState::Errored(_) => None,
            StreamState::Closed => Some(0),
            StreamState::Open => {
                let pending = state.queue.len() + usize::from(state.in_flight);
                Some(to_isize(self.high_water_mark) - to_isize(pending))
            }
        }
    }

    /// Recomputes backpressure; returns the ready signal to resolve if it lifted.
    fn update_backpressure(&self, state: &mut State) -> Option<Signal> {
        if !state.status.is_open() || state.close_requested {
            return None;
        }
        let backpressure = self.desired_size(state).is_some_and(|size| size <= 0);
        if backpressure == state.backpressure {
            return None;
        }
        state.backpressure = backpressure;
        if backpressure {
            state.ready = Completion::new();
            None
        } else {
            Some(state.ready.clone())
        }
    }

    fn advance(self: &Arc<Self>) {
        let job = {
            let mut state = self.state.lock();
            if !state.started || state.in_flight || !state.status.is_open() {
                return;
            }
            if let Some((chunk, signal)) = state.queue.pop_front() {
                state.in_flight = true;
                Job::Write(chunk, signal)
            } else if state.close_requested {
                let Some(signal) = state.close_signal.take() else {
                    return;
                };
                state.in_flight = true;
                Job::Close(signal)
            } else {
                return;
            }
        };
        let this = Arc::clone(self);
        drop(runtime::spawn(async move {
            match job {
                Job::Write(chunk, signal) => {
                    let len = chunk.len();
                    match this.sink.write(chunk).await {
                        Ok(()) => {
                            trace!(writable = this.id, len, "sink accepted chunk");
                            let lifted = {
                                let mut state = this.state.lock();
                                state.in_flight = false;
                                this.update_backpressure(&mut state)
                            };
                            signal.complete(Ok(()));
                            if let Some(ready) = lifted {
                                ready.complete(Ok(()));
                            }
                            this.advance();
                        }
                        Err(err) => {
                            this.state.lock().in_flight = false;
                            signal.complete(Err(err.clone()));
                            this.error(err);
                        }
                    }
                }
                Job::Close(signal) => match this.sink.close().await {
                    Ok(()) => {
                        let closed = {
                            let mut state = this.state.lock();
                            state.in_flight = false;
                            state.status = StreamState::Closed;
                            state.writer.as_ref().map(|slot| slot.closed.clone())
                        };
                        trace!(writable = this.id, "writable closed");
                        signal.complete(Ok(()));
                        if let Some(closed) = closed {
                            closed.complete(Ok(()));
                        }
                    }
                    Err(err) => {
                        this.state.lock().in_flight = false;
                        signal.complete(Err(err.clone()));
                        this.error(err);
                    }
                },
            }
        }));
    }

    fn error(&self, err: StreamError) {
        let (queued, close, ready, closed) = {
            let mut state = self.state.lock();
            if !state.status.is_open() {
                return;
            }
            state.status = StreamState::Errored(err.clone());
            let queued: SmallVec<[Signal; 4]> =
                state.queue.drain(..).map(|(_, signal)| signal).collect();
            let close = state.close_signal.take();
            let ready = if state.ready.is_complete() {
                state.ready = Completion::resolved(Err(err.clone()));
                None
            } else {
                Some(state.ready.clone())
            };
            let closed = state.writer.as_ref().map(|slot| slot.closed.clone());
            (queued, close, ready, closed)
        };
        debug!(writable = self.id, error = %err, "writable errored");
        for signal in queued.into_iter().chain(close).chain(ready).chain(closed) {
            signal.complete(Err(err.clone()));
        }
    }

    async fn abort(self: Arc<Self>, reason: Option<StreamError>) -> Result<(), StreamError> {
        {
            let state = self.state.lock();
            if !state.status.is_open() {
                return Ok(());
            }
        }
        let err = reason
            .clone()
            .unwrap_or_else(|| StreamError::from(BridgeError::Closed));
        self.error(err);
        self.sink.abort(reason).await
    }
}

fn to_isize(value: usize) -> isize {
    isize::try_from(value).unwrap_or(isize::MAX)
}

/// A writable stream delivering chunks to an [`UnderlyingSink`] in order.
#[derive(Clone)]
pub struct WritableStream {
    inner: Arc<Inner>,
}

impl WritableStream {
    /// Creates a stream over `sink` with a count-based high water mark.
    pub fn new(sink: impl UnderlyingSink, high_water_mark: usize) -> Self {
        Self::with_sink(Arc::new(sink), high_water_mark)
    }

    /// Creates a stream over a shared sink.
    pub fn with_sink(sink: Arc<dyn UnderlyingSink>, high_water_mark: usize) -> Self {
        let inner = Arc::new(Inner {
            id: NEXT_WRITABLE_ID.fetch_add(1, Ordering::Relaxed),
            high_water_mark,
            sink,
            state: Mutex::new(State {
                status: StreamState::Open,
                queue: VecDeque::new(),
                in_flight: false,
                started: false,
                close_requested: false,
                close_signal: None,
                backpressure: high_water_mark == 0,
                ready: if high_water_mark == 0 {
                    Completion::new()
                } else {
                    Completion::resolved(Ok(()))
                },
                writer: None,
                next_writer: 1,
            }),
        });
        trace!(writable = inner.id, high_water_mark, "writable created");
        let start = inner.sink.start();
        let this = Arc::clone(&inner);
        drop(runtime::spawn(async move {
            match start.await {
                Ok(()) => {
                    this.state.lock().started = true;
                    this.advance();
                }
                Err(err) => this.error(err),
            }
        }));
        Self { inner }
    }

    /// Process-unique id, used in logs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.inner.state.lock().status.clone()
    }

    /// Returns `true` while a writer holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().writer.is_some()
    }

    /// Returns `true` if both handles refer to the same stream.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Acquires the exclusive writer lock.
    pub fn get_writer(&self) -> Result<WritableWriter, BridgeError> {
        let mut state = self.inner.state.lock();
        if state.writer.is_some() {
            return Err(BridgeError::Locked);
        }
        let id = state.next_writer;
        state.next_writer += 1;
        let closed = match &state.status {
            StreamState::Open => Completion::new(),
            StreamState::Closed => Completion::resolved(Ok(())),
            StreamState::Errored(err) => Completion::resolved(Err(err.clone())),
        };
        state.writer = Some(WriterSlot {
            id,
            closed: closed.clone(),
        });
        trace!(writable = self.inner.id, writer = id, "writer acquired");
        Ok(WritableWriter {
            stream: self.clone(),
            id,
            closed,
        })
    }

    /// Aborts an unlocked stream.
    pub async fn abort(&self, reason: Option<StreamError>) -> Result<(), StreamError> {
        if self.is_locked() {
            return Err(BridgeError::Locked.into());
        }
        Arc::clone(&self.inner).abort(reason).await
    }
}

impl fmt::Debug for WritableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WritableStream")
            .field("id", &self.inner.id)
            .field("state", &state.status)
            .field("queued", &state.queue.len())
            .field("locked", &state.writer.is_some())
            .finish()
    }
}

/// Exclusive writer of a [`WritableStream`].
///
/// Clones share the same lock.
#[derive(Clone)]
pub struct WritableWriter {
    stream: WritableStream,
    id: u64,
    closed: Signal,
}

impl WritableWriter {
    fn holds_lock(&self, state: &State) -> bool {
        state.writer.as_ref().is_some_and(|slot| slot.id == self.id)
    }

    fn released() -> Wait<Result<(), StreamError>> {
        Completion::resolved(Err(BridgeError::Released.into())).wait()
    }

    /// The stream this writer is locked to.
    #[must_use]
    pub fn stream(&self) -> &WritableStream {
        &self.stream
    }

    /// Resolves while the queue is below the high water mark; fails with the
    /// stream's error once errored.
    pub fn ready(&self) -> Wait<Result<(), StreamError>> {
        let state = self.stream.inner.state.lock();
        if !self.holds_lock(&state) {
            return Self::released();
        }
        state.ready.wait()
    }

    /// Queues a chunk. Resolves once the sink accepted it.
    pub fn write(&self, chunk: impl Into<Chunk>) -> Wait<Result<(), StreamError>> {
        let inner = &self.stream.inner;
        let wait = {
            let mut state = inner.state.lock();
            if !self.holds_lock(&state) {
                return Self::released();
            }
            match &state.status {
                StreamState::Errored(err) => return Completion::resolved(Err(err.clone())).wait(),
                StreamState::Closed => {
                    return Completion::resolved(Err(BridgeError::Closed.into())).wait();
                }
                StreamState::Open if state.close_requested => {
                    return Completion::resolved(Err(BridgeError::Closed.into())).wait();
                }
                StreamState::Open => {}
            }
            let signal = Completion::new();
            let wait = signal.wait();
            state.queue.push_back((chunk.into().into_bytes(), signal));
            // Backpressure can only rise here; nothing to resolve.
            let _ = inner.update_backpressure(&mut state);
            wait
        };
        inner.advance();
        wait
    }

    /// Closes the stream after every queued write completes.
    pub fn close(&self) -> Wait<Result<(), StreamError>> {
        let inner = &self.stream.inner;
        let (wait, ready) = {
            let mut state = inner.state.lock();
            if !self.holds_lock(&state) {
                return Self::released();
            }
            match &state.status {
                StreamState::Errored(err) => return Completion::resolved(Err(err.clone())).wait(),
                StreamState::Closed => {
                    return Completion::resolved(Err(BridgeError::Closed.into())).wait();
                }
                StreamState::Open if state.close_requested => {
                    return Completion::resolved(Err(BridgeError::Closed.into())).wait();
                }
                StreamState::Open => {}
            }
            let signal = Completion::new();
            let wait = signal.wait();
            state.close_requested = true;
            state.close_signal = Some(signal);
            let ready = state.backpressure.then(|| state.ready.clone());
            state.backpressure = false;
            (wait, ready)
        };
        if let Some(ready) = ready {
            ready.complete(Ok(()));
        }
        inner.advance();
        wait
    }

    /// Aborts the stream: queued writes fail and the sink's `abort` runs.
    pub async fn abort(&self, reason: Option<StreamError>) -> Result<(), StreamError> {
        if !self.is_active() {
            return Err(BridgeError::Released.into());
        }
        Arc::clone(&self.stream.inner).abort(reason).await
    }

    /// Resolves when the stream closes, or fails with its error or with
    /// [`BridgeError::Released`] if the lock is released first.
    pub fn closed(&self) -> Wait<Result<(), StreamError>> {
        self.closed.wait()
    }

    /// High water mark minus queued writes; `None` once errored.
    pub fn desired_size(&self) -> Result<Option<isize>, BridgeError> {
        let state = self.stream.inner.state.lock();
        if !self.holds_lock(&state) {
            return Err(BridgeError::Released);
        }
        Ok(self.stream.inner.desired_size(&state))
    }

    /// Releases the lock. A pending `ready` and `closed` fail with
    /// [`BridgeError::Released`]; queued writes still reach the sink.
    pub fn release_lock(&self) -> Result<(), BridgeError> {
        let ready = {
            let mut state = self.stream.inner.state.lock();
            if !self.holds_lock(&state) {
                return Err(BridgeError::Released);
            }
            state.writer = None;
            // A pending ready means backpressure; the next writer waits on a fresh signal.
            if state.ready.is_complete() {
                None
            } else {
                let pending = state.ready.clone();
                state.ready = Completion::new();
                Some(pending)
            }
        };
        trace!(writable = self.stream.inner.id, writer = self.id, "writer released");
        let released: StreamError = BridgeError::Released.into();
        if let Some(ready) = ready {
            ready.complete(Err(released.clone()));
        }
        self.closed.complete(Err(released));
        Ok(())
    }

    /// Returns `true` while this writer holds the lock.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.holds_lock(&self.stream.inner.state.lock())
    }
}

impl fmt::Debug for WritableWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableWriter")
            .field("stream", &self.stream.inner.id)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Sink that collects every written chunk in memory.
#[derive(Debug, Clone, Default)]
pub struct CollectSink {
    chunks: Arc<Mutex<Vec<Vec<u8>>>>,
    closed: Arc<Mutex<bool>>,
}

impl CollectSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every chunk written so far.
    #[must_use]
    pub fn chunks(&self) -> Vec<Vec<u8>> {
        self.chunks.lock().clone()
    }

    /// All written bytes, concatenated.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.chunks.lock().concat()
    }

    /// Returns `true` once the sink's `close` ran.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl UnderlyingSink for CollectSink {
    fn write(&self, chunk: Vec<u8>) -> PullFuture {
        self.chunks.lock().push(chunk);
        resolved()
    }

    fn close(&self) -> PullFuture {
        *self.closed.lock() = true;
        resolved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{self, try_block_on};

    fn init_test(name: &str) {
        crate::test_utils::init_test_logging();
        crate::test_phase!(name);
    }

    struct Gated {
        gate: Completion<()>,
        seen: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl UnderlyingSink for Gated {
        fn write(&self, chunk: Vec<u8>) -> PullFuture {
            let gate = self.gate.clone();
            let seen = Arc::clone(&self.seen);
            Box::pin(async move {
                gate.wait().await;
                seen.lock().push(chunk);
                Ok(())
            })
        }
    }

    struct Failing(StreamError);

    impl UnderlyingSink for Failing {
        fn write(&self, _chunk: Vec<u8>) -> PullFuture {
            let err = self.0.clone();
            Box::pin(futures_lite::future::ready(Err(err)))
        }
    }

    #[test]
    fn writes_reach_sink_in_order_then_close() {
        init_test("writes_reach_sink_in_order_then_close");
        let sink = CollectSink::new();
        let stream = WritableStream::new(sink.clone(), 1);
        let writer = stream.get_writer().expect("writer");
        let a = writer.write("wor");
        let b = writer.write(b"ld".to_vec());
        let close = writer.close();
        assert!(try_block_on(a).expect("a settles").is_ok());
        assert!(try_block_on(b).expect("b settles").is_ok());
        assert!(try_block_on(close).expect("close settles").is_ok());
        crate::assert_with_log!(sink.bytes() == b"world", "sink bytes", "world", sink.bytes());
        assert!(sink.is_closed());
        assert!(try_block_on(writer.closed()).expect("closed").is_ok());
        assert!(stream.state().is_closed());
        crate::test_complete!("writes_reach_sink_in_order_then_close");
    }

    #[test]
    fn ready_tracks_backpressure() {
        init_test("ready_tracks_backpressure");
        let gate = Completion::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let stream = WritableStream::new(
            Gated {
                gate: gate.clone(),
                seen: Arc::clone(&seen),
            },
            1,
        );
        let writer = stream.get_writer().expect("writer");
        runtime::run_until_stalled();
        assert!(try_block_on(writer.ready()).expect("ready").is_ok());
        assert_eq!(writer.desired_size().expect("active"), Some(1));

        let write = writer.write("a");
        assert_eq!(writer.desired_size().expect("active"), Some(0));
        runtime::run_until_stalled();
        let blocked = try_block_on(writer.ready());
        crate::assert_with_log!(blocked.is_none(), "ready blocked", "pending", blocked);

        gate.complete(());
        assert!(try_block_on(write).expect("write").is_ok());
        assert!(try_block_on(writer.ready()).expect("ready").is_ok());
        assert_eq!(seen.lock().len(), 1);
        crate::test_complete!("ready_tracks_backpressure");
    }

    #[test]
    fn sink_error_errors_stream_with_same_identity() {
        init_test("sink_error_errors_stream_with_same_identity");
        let cause = StreamError::msg("disk full");
        let stream = WritableStream::new(Failing(cause.clone()), 1);
        let writer = stream.get_writer().expect("writer");
        let first = try_block_on(writer.write("x")).expect("settles");
        assert!(StreamError::same(&first.expect_err("failed"), &cause));
        let ready = try_block_on(writer.ready()).expect("settles");
        assert!(StreamError::same(&ready.expect_err("errored"), &cause));
        let closed = try_block_on(writer.closed()).expect("settles");
        assert!(StreamError::same(&closed.expect_err("errored"), &cause));
        let later = try_block_on(writer.write("y")).expect("settles");
        assert!(StreamError::same(&later.expect_err("errored"), &cause));
        crate::test_complete!("sink_error_errors_stream_with_same_identity");
    }

    #[test]
    fn release_rejects_pending_ready_and_allows_reacquire() {
        init_test("release_rejects_pending_ready_and_allows_reacquire");
        let gate = Completion::new();
        let stream = WritableStream::new(
            Gated {
                gate: gate.clone(),
                seen: Arc::new(Mutex::new(Vec::new())),
            },
            1,
        );
        let writer = stream.get_writer().expect("writer");
        assert!(matches!(stream.get_writer(), Err(BridgeError::Locked)));
        let _write = writer.write("queued");
        let ready = writer.ready();
        writer.release_lock().expect("release");
        let outcome = try_block_on(ready).expect("settles");
        assert!(outcome.expect_err("released").is_released());
        assert!(matches!(writer.release_lock(), Err(BridgeError::Released)));
        assert!(try_block_on(writer.write("late")).expect("settles").is_err());

        let next = stream.get_writer().expect("reacquire");
        gate.complete(());
        runtime::run_until_stalled();
        assert!(try_block_on(next.ready()).expect("ready").is_ok());
        crate::test_complete!("release_rejects_pending_ready_and_allows_reacquire");
    }

    #[test]
    fn abort_fails_queued_writes() {
        init_test("abort_fails_queued_writes");
        let gate = Completion::new();
        let stream = WritableStream::new(
            Gated {
                gate,
                seen: Arc::new(Mutex::new(Vec::new())),
            },
            4,
        );
        let writer = stream.get_writer().expect("writer");
        let _first = writer.write("in-flight");
        runtime::run_until_stalled();
        let queued = writer.write("queued");
        let reason = StreamError::msg("abandoned");
        assert!(try_block_on(writer.abort(Some(reason.clone()))).expect("settles").is_ok());
        let err = try_block_on(queued).expect("settles").expect_err("aborted");
        assert!(StreamError::same(&err, &reason));
        assert!(stream.state().error().is_some());
        crate::test_complete!("abort_fails_queued_writes");
    }
}
