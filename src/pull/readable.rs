//! Readable pull streams.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::{PullFuture, StreamState, resolved};
use crate::chunk::Chunk;
use crate::config::ReadableMode;
use crate::error::{BridgeError, StreamError};
use crate::runtime;
use crate::sync::{Completion, Wait};
use crate::tracing_compat::{debug, trace};

static NEXT_READABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of a read: a chunk, `None` at end of stream, or the stream's error.
pub type ReadResult = Result<Option<Vec<u8>>, StreamError>;

/// Future returned by [`ReadableReader::read`].
pub type ReadFuture = Wait<ReadResult>;

/// Producer behind a [`ReadableStream`].
pub trait UnderlyingSource: Send + Sync + 'static {
    /// Called once at construction. Data may be enqueued right away.
    fn start(&self, controller: &ReadableController) -> PullFuture {
        let _ = controller;
        resolved()
    }

    /// Called when the stream wants more data.
    fn pull(&self, controller: &ReadableController) -> PullFuture {
        let _ = controller;
        resolved()
    }

    /// Called when the consumer abandons the stream.
    fn cancel(&self, reason: Option<StreamError>) -> PullFuture {
        let _ = reason;
        resolved()
    }
}

struct ReaderSlot {
    id: u64,
    closed: Completion<Result<(), StreamError>>,
}

struct State {
    status: StreamState,
    queue: VecDeque<Vec<u8>>,
    queue_size: usize,
    close_requested: bool,
    started: bool,
    pulling: bool,
    pull_again: bool,
    read_requests: VecDeque<Completion<ReadResult>>,
    reader: Option<ReaderSlot>,
    next_reader: u64,
}

/// Completions to settle once the state lock is dropped.
#[derive(Default)]
struct Settle {
    reads: SmallVec<[(Completion<ReadResult>, ReadResult); 2]>,
    closed: Option<(Completion<Result<(), StreamError>>, Result<(), StreamError>)>,
}

impl Settle {
    fn run(self) {
        for (request, result) in self.reads {
            request.complete(result);
        }
        if let Some((closed, result)) = self.closed {
            closed.complete(result);
        }
    }
}

struct Inner {
    id: u64,
    mode: ReadableMode,
    high_water_mark: usize,
    source: Arc<dyn UnderlyingSource>,
    state: Mutex<State>,
}

impl Inner {
    fn desired_size(&self, state: &State) -> Option<isize> {
        match state.status {
            StreamState::Errored(_) => None,
            StreamState::Closed => Some(0),
            StreamState::Open => Some(to_isize(self.high_water_mark) - to_isize(state.queue_size)),
        }
    }

    fn should_call_pull(&self, state: &State) -> bool {
        if !state.status.is_open() || !state.started || state.close_requested {
            return false;
        }
        if state.reader.is_some() && !state.read_requests.is_empty() {
            return true;
        }
        self.desired_size(state).is_some_and(|size| size > 0)
    }

    fn call_pull_if_needed(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if !self.should_call_pull(&state) {
                return;
            }
            if state.pulling {
                state.pull_again = true;
                return;
            }
            state.pulling = true;
        }
        let this = Arc::clone(self);
        drop(runtime::spawn(async move {
            let controller = ReadableController {
                inner: Arc::downgrade(&this),
            };
            trace!(readable = this.id, "pull");
            match this.source.pull(&controller).await {
                Ok(()) => {
                    let again = {
                        let mut state = this.state.lock();
                        state.pulling = false;
                        std::mem::take(&mut state.pull_again)
                    };
                    if again {
                        this.call_pull_if_needed();
                    }
                }
                Err(err) => this.error(err),
            }
        }));
    }

    fn close_now(state: &mut State, settle: &mut Settle) {
        state.status = StreamState::Closed;
        for request in state.read_requests.drain(..) {
            settle.reads.push((request, Ok(None)));
        }
        if let Some(reader) = &state.reader {
            settle.closed = Some((reader.closed.clone(), Ok(())));
        }
    }

    fn enqueue(self: &Arc<Self>, chunk: Chunk) -> Result<(), StreamError> {
        let mut settle = Settle::default();
        {
            let mut state = self.state.lock();
            if state.close_requested || !state.status.is_open() {
                return Err(BridgeError::Closed.into());
            }
            let bytes = chunk.into_bytes();
            if let Some(request) = state.read_requests.pop_front() {
                settle.reads.push((request, Ok(Some(bytes))));
            } else {
                state.queue_size += self.mode.chunk_size(bytes.len());
                state.queue.push_back(bytes);
            }
        }
        settle.run();
        self.call_pull_if_needed();
        Ok(())
    }

    fn close(&self) -> Result<(), StreamError> {
        let mut settle = Settle::default();
        {
            let mut state = self.state.lock();
            if state.close_requested || !state.status.is_open() {
                return Err(BridgeError::Closed.into());
            }
            state.close_requested = true;
            if state.queue.is_empty() {
                Self::close_now(&mut state, &mut settle);
            }
        }
        trace!(readable = self.id, "close requested");
        settle.run();
        Ok(())
    }

    fn error(&self, err: StreamError) {
        let mut settle = Settle::default();
        {
            let mut state = self.state.lock();
            if !state.status.is_open() {
                return;
            }
            state.status = StreamState::Errored(err.clone());
            state.queue.clear();
            state.queue_size = 0;
            for request in state.read_requests.drain(..) {
                settle.reads.push((request, Err(err.clone())));
            }
            if let Some(reader) = &state.reader {
                settle.closed = Some((reader.closed.clone(), Err(err.clone())));
            }
        }
        debug!(readable = self.id, error = %err, "readable errored");
        settle.run();
    }

    async fn cancel(self: Arc<Self>, reason: Option<StreamError>) -> Result<(), StreamError> {
        let mut settle = Settle::default();
        {
            let mut state = self.state.lock();
            match &state.status {
                StreamState::Closed => return Ok(()),
                StreamState::Errored(err) => return Err(err.clone()),
                StreamState::Open => {}
            }
            state.queue.clear();
            state.queue_size = 0;
            Self::close_now(&mut state, &mut settle);
        }
        debug!(readable = self.id, "readable cancelled");
        settle.run();
        self.source.cancel(reason).await
    }
}

fn to_isize(value: usize) -> isize {
    isize::try_from(value).unwrap_or(isize::MAX)
}

/// Handle a source uses to feed its stream.
#[derive(Clone)]
pub struct ReadableController {
    inner: Weak<Inner>,
}

impl ReadableController {
    fn with_inner<R>(&self, f: impl FnOnce(&Arc<Inner>) -> R) -> Option<R> {
        self.inner.upgrade().map(|inner| f(&inner))
    }

    /// Queues a chunk, or hands it straight to a waiting read.
    ///
    /// Text is coerced to bytes. Fails once the stream is closing, closed or
    /// errored.
    pub fn enqueue(&self, chunk: impl Into<Chunk>) -> Result<(), StreamError> {
        let chunk = chunk.into();
        self.with_inner(|inner| inner.enqueue(chunk))
            .unwrap_or_else(|| Err(BridgeError::Closed.into()))
    }

    /// Closes the stream once the queue drains.
    pub fn close(&self) -> Result<(), StreamError> {
        self.with_inner(|inner| inner.close())
            .unwrap_or_else(|| Err(BridgeError::Closed.into()))
    }

    /// Errors the stream. Pending and future reads fail with `err`.
    pub fn error(&self, err: StreamError) {
        self.with_inner(|inner| inner.error(err));
    }

    /// High water mark minus queued size; `None` once errored.
    #[must_use]
    pub fn desired_size(&self) -> Option<isize> {
        self.with_inner(|inner| inner.desired_size(&inner.state.lock()))
            .flatten()
    }
}

impl fmt::Debug for ReadableController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableController")
            .field("desired_size", &self.desired_size())
            .finish()
    }
}

/// A consumer-driven readable stream.
#[derive(Clone)]
pub struct ReadableStream {
    inner: Arc<Inner>,
}

impl ReadableStream {
    /// Creates a stream over `source` using the mode's default high water mark.
    pub fn new(source: impl UnderlyingSource, mode: ReadableMode) -> Self {
        Self::with_high_water_mark(Arc::new(source), mode, mode.default_high_water_mark())
    }

    /// Creates a stream with an explicit high water mark.
    pub fn with_high_water_mark(
        source: Arc<dyn UnderlyingSource>,
        mode: ReadableMode,
        high_water_mark: usize,
    ) -> Self {
        let inner = Arc::new(Inner {
            id: NEXT_READABLE_ID.fetch_add(1, Ordering::Relaxed),
            mode,
            high_water_mark,
            source,
            state: Mutex::new(State {
                status: StreamState::Open,
                queue: VecDeque::new(),
                queue_size: 0,
                close_requested: false,
                started: false,
                pulling: false,
                pull_again: false,
                read_requests: VecDeque::new(),
                reader: None,
                next_reader: 1,
            }),
        });
        trace!(readable = inner.id, %mode, high_water_mark, "readable created");
        let controller = ReadableController {
            inner: Arc::downgrade(&inner),
        };
        let start = inner.source.start(&controller);
        let this = Arc::clone(&inner);
        drop(runtime::spawn(async move {
            match start.await {
                Ok(()) => {
                    this.state.lock().started = true;
                    this.call_pull_if_needed();
                }
                Err(err) => this.error(err),
            }
        }));
        Self { inner }
    }

    /// A stream that yields `chunks` in order, then closes.
    pub fn from_chunks<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Chunk>,
    {
        Self::new(ChunksSource::new(chunks), ReadableMode::Default)
    }

    /// A stream that closes without yielding anything.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_chunks(Vec::<Chunk>::new())
    }

    /// Process-unique id, used in logs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Queueing mode.
    #[must_use]
    pub fn mode(&self) -> ReadableMode {
        self.inner.mode
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.inner.state.lock().status.clone()
    }

    /// Returns `true` while a reader holds the lock.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.state.lock().reader.is_some()
    }

    /// Returns `true` if both handles refer to the same stream.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Acquires the exclusive reader lock.
    pub fn get_reader(&self) -> Result<ReadableReader, BridgeError> {
        let mut state = self.inner.state.lock();
        if state.reader.is_some() {
            return Err(BridgeError::Locked);
        }
        let id = state.next_reader;
        state.next_reader += 1;
        let closed = match &state.status {
            StreamState::Open => Completion::new(),
            StreamState::Closed => Completion::resolved(Ok(())),
            StreamState::Errored(err) => Completion::resolved(Err(err.clone())),
        };
        state.reader = Some(ReaderSlot {
            id,
            closed: closed.clone(),
        });
        trace!(readable = self.inner.id, reader = id, "reader acquired");
        Ok(ReadableReader {
            stream: self.clone(),
            id,
            closed,
        })
    }

    /// Cancels an unlocked stream.
    pub async fn cancel(&self, reason: Option<StreamError>) -> Result<(), StreamError> {
        if self.is_locked() {
            return Err(BridgeError::Locked.into());
        }
        Arc::clone(&self.inner).cancel(reason).await
    }
}

impl fmt::Debug for ReadableStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ReadableStream")
            .field("id", &self.inner.id)
            .field("mode", &self.inner.mode)
            .field("state", &state.status)
            .field("queued", &state.queue.len())
            .field("locked", &state.reader.is_some())
            .finish()
    }
}

/// Exclusive reader of a [`ReadableStream`].
///
/// Clones share the same lock; releasing through any clone releases it for all.
#[derive(Clone)]
pub struct ReadableReader {
    stream: ReadableStream,
    id: u64,
    closed: Completion<Result<(), StreamError>>,
}

impl ReadableReader {
    fn holds_lock(&self, state: &State) -> bool {
        state.reader.as_ref().is_some_and(|slot| slot.id == self.id)
    }

    /// The stream this reader is locked to.
    #[must_use]
    pub fn stream(&self) -> &ReadableStream {
        &self.stream
    }

    /// Reads the next chunk.
    pub fn read(&self) -> ReadFuture {
        let inner = &self.stream.inner;
        let mut settle = Settle::default();
        let future = {
            let mut state = inner.state.lock();
            if !self.holds_lock(&state) {
                return Completion::resolved(Err(BridgeError::Released.into())).wait();
            }
            if let Some(bytes) = state.queue.pop_front() {
                state.queue_size = state
                    .queue_size
                    .saturating_sub(inner.mode.chunk_size(bytes.len()));
                if state.close_requested && state.queue.is_empty() {
                    Inner::close_now(&mut state, &mut settle);
                }
                Completion::resolved(Ok(Some(bytes))).wait()
            } else {
                match &state.status {
                    StreamState::Closed => Completion::resolved(Ok(None)).wait(),
                    StreamState::Errored(err) => Completion::resolved(Err(err.clone())).wait(),
                    StreamState::Open => {
                        let request = Completion::new();
                        let wait = request.wait();
                        state.read_requests.push_back(request);
                        wait
                    }
                }
            }
        };
        settle.run();
        inner.call_pull_if_needed();
        future
    }

    /// Resolves when the stream closes, or fails with its error or with
    /// [`BridgeError::Released`] if the lock is released first.
    pub fn closed(&self) -> Wait<Result<(), StreamError>> {
        self.closed.wait()
    }

    /// Cancels the stream through this reader.
    pub async fn cancel(&self, reason: Option<StreamError>) -> Result<(), StreamError> {
        if !self.is_active() {
            return Err(BridgeError::Released.into());
        }
        Arc::clone(&self.stream.inner).cancel(reason).await
    }

    /// Releases the lock. Pending reads and `closed` fail with
    /// [`BridgeError::Released`]. Releasing twice is an error.
    pub fn release_lock(&self) -> Result<(), BridgeError> {
        let pending: SmallVec<[Completion<ReadResult>; 2]> = {
            let mut state = self.stream.inner.state.lock();
            if !self.holds_lock(&state) {
                return Err(BridgeError::Released);
            }
            state.reader = None;
            state.read_requests.drain(..).collect()
        };
        trace!(readable = self.stream.inner.id, reader = self.id, "reader released");
        let released: StreamError = BridgeError::Released.into();
        for request in pending {
            request.complete(Err(released.clone()));
        }
        self.closed.complete(Err(released));
        Ok(())
    }

    /// Returns `true` while this reader holds the lock.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.holds_lock(&self.stream.inner.state.lock())
    }
}

impl fmt::Debug for ReadableReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableReader")
            .field("stream", &self.stream.inner.id)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Source that enqueues a fixed list of chunks at start, then closes.
#[derive(Debug, Default)]
pub struct ChunksSource {
    chunks: Mutex<Vec<Chunk>>,
}

impl ChunksSource {
    /// Creates a source over `chunks`.
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Chunk>,
    {
        Self {
            chunks: Mutex::new(chunks.into_iter().map(Into::into).collect()),
        }
    }
}

impl UnderlyingSource for ChunksSource {
    fn start(&self, controller: &ReadableController) -> PullFuture {
        let chunks = std::mem::take(&mut *self.chunks.lock());
        let outcome = chunks
            .into_iter()
            .try_for_each(|chunk| controller.enqueue(chunk))
            .and_then(|()| controller.close());
        Box::pin(futures_lite::future::ready(outcome))
    }
}
