//! Event-driven push streams.
//!
//! A [`PushStream`] is the producer-driven half of the bridge. Its readable side
//! buffers chunks handed to [`PushStream::push`] and emits them as `Data` events
//! while flowing. Its writable side queues chunks handed to [`PushStream::write`]
//! and feeds them to the [`PushBehavior::write`] hook one at a time, reporting
//! backpressure through the boolean return value.
//!
//! # State machine
//!
//! All emission happens on scheduler ticks, never inside the call that changed
//! state. A tick repeatedly picks the next step under the state lock, releases
//! the lock, then performs the step:
//!
//! ```text
//! readable: Data* (while flowing) -> End
//! writable: write hook* -> [Drain] -> final hook -> Finish
//! both:     End + Finish -> destroy -> [Error] -> Close
//! ```
//!
//! `destroy` is idempotent. It settles every drain waiter with `false`, runs the
//! destroy hook at once, and emits `Error` (when given) and `Close` after the
//! in-flight hooks have settled.
//!
//! # Locking
//!
//! State and listeners sit behind separate `parking_lot` mutexes. Neither is held
//! while a listener or hook runs, so listeners may call back into the stream.

mod behavior;
mod event;

pub use behavior::{ChunkSource, FnBehavior, HookFuture, PushBehavior, done, fail};
pub use event::{Event, EventKind, ListenerFn, ListenerId};

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::chunk::Chunk;
use crate::config::PushOptions;
use crate::drain::DrainQueue;
use crate::error::{BridgeError, StreamError};
use crate::runtime;
use crate::sync::{Completion, Wait};
use crate::tracing_compat::{debug, trace, warn};
use event::Listeners;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Which sides a push stream exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushKind {
    /// Readable side only.
    Readable,
    /// Writable side only.
    Writable,
    /// Independent readable and writable sides.
    Duplex,
    /// Readable and writable sides where output derives from input.
    Transform,
}

impl PushKind {
    /// Returns `true` if the stream has a readable side.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        !matches!(self, Self::Writable)
    }

    /// Returns `true` if the stream has a writable side.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::Readable)
    }
}

/// Mutable state of a push stream.
#[derive(Debug, Default)]
pub(crate) struct PushState {
    // readable side
    pub(crate) buffer: VecDeque<Chunk>,
    pub(crate) buffered: usize,
    pub(crate) flowing: bool,
    pub(crate) pushed_end: bool,
    pub(crate) end_emitted: bool,
    pub(crate) reading: bool,
    pub(crate) pushed_since_read: bool,
    pub(crate) read_idle: bool,
    // writable side
    pub(crate) queue: VecDeque<Chunk>,
    pub(crate) queued: usize,
    pub(crate) writing: bool,
    pub(crate) ending: bool,
    pub(crate) final_started: bool,
    pub(crate) final_in_flight: bool,
    pub(crate) final_done: bool,
    pub(crate) finish_emitted: bool,
    pub(crate) needs_drain: bool,
    pub(crate) drains: DrainQueue,
    // lifecycle
    pub(crate) destroying: bool,
    pub(crate) destroy_hook_done: bool,
    pub(crate) closed: bool,
    pub(crate) error: Option<StreamError>,
    pub(crate) tick_scheduled: bool,
}

enum Step {
    Data(Chunk),
    End,
    Read,
    Write(Chunk),
    Final,
    Drain,
    Finish,
}

struct Inner {
    id: u64,
    kind: PushKind,
    options: PushOptions,
    behavior: Arc<dyn PushBehavior>,
    state: Mutex<PushState>,
    listeners: Mutex<Listeners>,
    ended: Completion<Result<(), StreamError>>,
    finished: Completion<Result<(), StreamError>>,
    closed: Completion<Option<StreamError>>,
}

/// Handle to a push stream. Clones refer to the same stream.
#[derive(Clone)]
pub struct PushStream {
    inner: Arc<Inner>,
}

/// Non-owning handle to a push stream.
#[derive(Clone)]
pub struct WeakPushStream {
    inner: Weak<Inner>,
}

impl WeakPushStream {
    /// Returns the stream if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<PushStream> {
        self.inner.upgrade().map(|inner| PushStream { inner })
    }
}

impl fmt::Debug for WeakPushStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakPushStream").finish_non_exhaustive()
    }
}

impl PushStream {
    /// Creates a stream of `kind` driven by `behavior`.
    pub fn new(kind: PushKind, behavior: impl PushBehavior, options: PushOptions) -> Self {
        Self::with_behavior(kind, Arc::new(behavior), options)
    }

    /// Creates a stream around a shared behavior.
    pub fn with_behavior(
        kind: PushKind,
        behavior: Arc<dyn PushBehavior>,
        options: PushOptions,
    ) -> Self {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        trace!(stream = id, ?kind, "push stream created");
        Self {
            inner: Arc::new(Inner {
                id,
                kind,
                options,
                behavior,
                state: Mutex::new(PushState::default()),
                listeners: Mutex::new(Listeners::default()),
                ended: Completion::new(),
                finished: Completion::new(),
                closed: Completion::new(),
            }),
        }
    }

    /// A readable stream that emits `chunks` in order, then ends.
    pub fn from_chunks<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Chunk>,
    {
        Self::new(
            PushKind::Readable,
            ChunkSource::new(chunks),
            PushOptions::default(),
        )
    }

    /// Process-unique stream id, used in logs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The sides this stream exposes.
    #[must_use]
    pub fn kind(&self) -> PushKind {
        self.inner.kind
    }

    /// Returns `true` if the stream has a readable side.
    #[must_use]
    pub fn is_readable(&self) -> bool {
        self.inner.kind.is_readable()
    }

    /// Returns `true` if the stream has a writable side.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.inner.kind.is_writable()
    }

    /// Options the stream was created with.
    #[must_use]
    pub fn options(&self) -> PushOptions {
        self.inner.options
    }

    /// Returns `true` if both handles refer to the same stream.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Returns a non-owning handle.
    #[must_use]
    pub fn downgrade(&self) -> WeakPushStream {
        WeakPushStream {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut PushState) -> R) -> R {
        f(&mut self.inner.state.lock())
    }

    // ----- readable side -----

    /// Hands a chunk to the readable side, or `None` to signal end of data.
    ///
    /// Returns `false` once the buffer reaches the high water mark, after end was
    /// pushed, or after the stream was destroyed.
    pub fn push(&self, chunk: Option<Chunk>) -> bool {
        if !self.is_readable() {
            return false;
        }
        let accepted = {
            let mut state = self.inner.state.lock();
            if state.destroying || state.pushed_end {
                return false;
            }
            match chunk {
                Some(chunk) => {
                    state.pushed_since_read = true;
                    state.read_idle = false;
                    state.buffered += chunk.len();
                    state.buffer.push_back(chunk);
                    state.buffered < self.inner.options.high_water_mark
                }
                None => {
                    state.pushed_since_read = true;
                    state.pushed_end = true;
                    false
                }
            }
        };
        self.schedule();
        accepted
    }

    /// Stops `Data` emission. Buffered chunks stay buffered.
    pub fn pause(&self) {
        self.inner.state.lock().flowing = false;
    }

    /// Resumes `Data` emission.
    pub fn resume(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.flowing {
                return;
            }
            state.flowing = true;
            state.read_idle = false;
        }
        self.schedule();
    }

    /// Returns `true` while `Data` emission is stopped.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        !self.inner.state.lock().flowing
    }

    /// Bytes pushed but not yet emitted.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.inner.state.lock().buffered
    }

    /// Returns `true` once `End` was emitted.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.inner.state.lock().end_emitted
    }

    // ----- writable side -----

    /// Queues a chunk for the write hook.
    ///
    /// Returns `Ok(false)` when queued bytes reach the high water mark; the caller
    /// should wait for `Drain` (or [`drained`](crate::drain::drained)) before
    /// writing more.
    pub fn write(&self, chunk: impl Into<Chunk>) -> Result<bool, StreamError> {
        if !self.is_writable() {
            return Err(BridgeError::NotWritable.into());
        }
        let chunk = chunk.into();
        let accepted = {
            let mut state = self.inner.state.lock();
            if state.destroying {
                return Err(state
                    .error
                    .clone()
                    .unwrap_or_else(|| BridgeError::Destroyed.into()));
            }
            if state.ending {
                return Err(BridgeError::WriteAfterEnd.into());
            }
            state.queued += chunk.len();
            state.queue.push_back(chunk);
            let accepted = state.queued < self.inner.options.high_water_mark;
            if !accepted {
                state.needs_drain = true;
            }
            accepted
        };
        self.schedule();
        Ok(accepted)
    }

    /// Signals end of input. Later writes fail with [`BridgeError::WriteAfterEnd`].
    pub fn end(&self) {
        if !self.is_writable() {
            return;
        }
        {
            let mut state = self.inner.state.lock();
            if state.destroying || state.ending {
                return;
            }
            state.ending = true;
        }
        trace!(stream = self.inner.id, "end requested");
        self.schedule();
    }

    /// Writes a final chunk, then ends.
    pub fn end_with(&self, chunk: impl Into<Chunk>) -> Result<(), StreamError> {
        self.write(chunk)?;
        self.end();
        Ok(())
    }

    /// Chunks queued behind the in-flight write.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Returns `true` while the write hook runs.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.inner.state.lock().writing
    }

    /// Returns `true` once `end` was requested.
    #[must_use]
    pub fn is_ending(&self) -> bool {
        self.inner.state.lock().ending
    }

    /// Returns `true` once `Finish` was emitted.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.state.lock().finish_emitted
    }

    // ----- lifecycle -----

    /// Tears the stream down. Idempotent; only the first call's error is kept.
    pub fn destroy(&self, error: Option<StreamError>) {
        let cancelled = {
            let mut state = self.inner.state.lock();
            if state.destroying {
                return;
            }
            state.destroying = true;
            state.error.clone_from(&error);
            state.buffer.clear();
            state.buffered = 0;
            state.queue.clear();
            state.queued = 0;
            state.drains.cancel_all()
        };
        debug!(
            stream = self.inner.id,
            error = ?error.as_ref().map(ToString::to_string),
            "destroying push stream"
        );
        for signal in cancelled {
            signal.complete(false);
        }
        let hook = self.inner.behavior.destroy(self, error.as_ref());
        let this = self.clone();
        drop(runtime::spawn(async move {
            let outcome = hook.await;
            {
                let mut state = this.inner.state.lock();
                state.destroy_hook_done = true;
                if let Err(err) = outcome {
                    if state.error.is_none() {
                        state.error = Some(err);
                    }
                }
            }
            this.maybe_close();
        }));
    }

    /// Returns `true` once destroy has started.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroying
    }

    /// Returns `true` once `Close` was emitted.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// The error the stream was destroyed with, if any.
    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        self.inner.state.lock().error.clone()
    }

    /// Emits an `Error` event without destroying the stream.
    pub fn emit_error(&self, error: &StreamError) {
        self.emit(&Event::Error(error));
    }

    /// Resolves once `End` is emitted, or with the close error if the stream
    /// closes first.
    pub fn ended(&self) -> Wait<Result<(), StreamError>> {
        self.inner.ended.wait()
    }

    /// Resolves once `Finish` is emitted, or with the close error if the stream
    /// closes first.
    pub fn finished(&self) -> Wait<Result<(), StreamError>> {
        self.inner.finished.wait()
    }

    /// Resolves with the destroy error once `Close` is emitted.
    pub fn closed(&self) -> Wait<Option<StreamError>> {
        self.inner.closed.wait()
    }

    // ----- listeners -----

    /// Registers a listener. A `Data` listener also resumes flow.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event<'_>) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.lock().add(kind, false, Arc::new(listener));
        if kind == EventKind::Data {
            self.resume();
        }
        id
    }

    /// Registers a listener that is removed after its first call.
    pub fn once<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&Event<'_>) + Send + Sync + 'static,
    {
        let id = self.inner.listeners.lock().add(kind, true, Arc::new(listener));
        if kind == EventKind::Data {
            self.resume();
        }
        id
    }

    /// Registers a `Data` listener receiving the chunk directly.
    pub fn on_data<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Chunk) + Send + Sync + 'static,
    {
        self.on(EventKind::Data, move |event| {
            if let Event::Data(chunk) = event {
                listener(chunk);
            }
        })
    }

    /// Registers an `Error` listener receiving the error directly.
    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StreamError) + Send + Sync + 'static,
    {
        self.on(EventKind::Error, move |event| {
            if let Event::Error(err) = event {
                listener(err);
            }
        })
    }

    /// Removes a listener. Returns `false` if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.listeners.lock().remove(id)
    }

    /// Number of listeners registered for `kind`.
    #[must_use]
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.listeners.lock().count(kind)
    }

    fn emit(&self, event: &Event<'_>) {
        let kind = event.kind();
        let callbacks = self.inner.listeners.lock().snapshot(kind);
        if callbacks.is_empty() {
            if let Event::Error(err) = event {
                warn!(stream = self.inner.id, error = %err, "error emitted with no listener");
            }
            return;
        }
        trace!(stream = self.inner.id, event = %kind, listeners = callbacks.len(), "emit");
        for callback in callbacks {
            callback(event);
        }
    }

    // ----- engine -----

    fn schedule(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.tick_scheduled || state.closed {
                return;
            }
            state.tick_scheduled = true;
        }
        let this = self.clone();
        drop(runtime::spawn(async move { this.tick() }));
    }

    fn next_step(&self, state: &mut PushState) -> Option<Step> {
        if state.destroying {
            return None;
        }
        let kind = self.inner.kind;
        if kind.is_readable() {
            if state.flowing {
                if let Some(chunk) = state.buffer.pop_front() {
                    state.buffered = state.buffered.saturating_sub(chunk.len());
                    return Some(Step::Data(chunk));
                }
            }
            if state.pushed_end && state.buffer.is_empty() && !state.end_emitted {
                state.end_emitted = true;
                return Some(Step::End);
            }
        }
        if kind.is_writable() && !state.writing {
            if let Some(chunk) = state.queue.pop_front() {
                state.writing = true;
                return Some(Step::Write(chunk));
            }
            if state.needs_drain {
                state.needs_drain = false;
                return Some(Step::Drain);
            }
            if state.ending && !state.final_started {
                state.final_started = true;
                state.final_in_flight = true;
                return Some(Step::Final);
            }
            if state.final_done && !state.finish_emitted {
                state.finish_emitted = true;
                return Some(Step::Finish);
            }
        }
        if kind.is_readable()
            && state.flowing
            && !state.reading
            && !state.read_idle
            && !state.pushed_end
            && (state.buffer.is_empty() || state.buffered < self.inner.options.high_water_mark)
        {
            state.reading = true;
            state.pushed_since_read = false;
            return Some(Step::Read);
        }
        None
    }

    fn tick(&self) {
        self.inner.state.lock().tick_scheduled = false;
        loop {
            let step = {
                let mut state = self.inner.state.lock();
                self.next_step(&mut state)
            };
            let Some(step) = step else {
                break;
            };
            match step {
                Step::Data(chunk) => self.emit(&Event::Data(&chunk)),
                Step::End => {
                    trace!(stream = self.inner.id, "readable ended");
                    self.emit(&Event::End);
                    self.inner.ended.complete(Ok(()));
                    self.maybe_auto_destroy();
                }
                Step::Read => self.start_read(),
                Step::Write(chunk) => self.start_write(chunk),
                Step::Final => self.start_final(),
                Step::Drain => self.emit(&Event::Drain),
                Step::Finish => {
                    trace!(stream = self.inner.id, "writable finished");
                    self.emit(&Event::Finish);
                    self.inner.finished.complete(Ok(()));
                    self.maybe_auto_destroy();
                }
            }
        }
    }

    fn start_read(&self) {
        let hook = self.inner.behavior.read(self);
        let this = self.clone();
        drop(runtime::spawn(async move {
            let outcome = hook.await;
            {
                // A read that produced nothing waits for the next push or resume.
                let mut state = this.inner.state.lock();
                state.reading = false;
                if !state.pushed_since_read {
                    state.read_idle = true;
                }
            }
            if let Err(err) = outcome {
                this.destroy(Some(err));
            }
            this.settle();
        }));
    }

    fn start_write(&self, chunk: Chunk) {
        let len = chunk.len();
        let hook = self.inner.behavior.write(self, chunk);
        let this = self.clone();
        drop(runtime::spawn(async move {
            let outcome = hook.await;
            let drained = {
                let mut state = this.inner.state.lock();
                state.writing = false;
                state.queued = state.queued.saturating_sub(len);
                if outcome.is_ok() {
                    state.drains.on_write_complete()
                } else {
                    smallvec::SmallVec::new()
                }
            };
            match outcome {
                Ok(()) => {
                    for signal in drained {
                        signal.complete(true);
                    }
                }
                Err(err) => this.destroy(Some(err)),
            }
            this.settle();
        }));
    }

    fn start_final(&self) {
        let hook = self.inner.behavior.finalize(self);
        let this = self.clone();
        drop(runtime::spawn(async move {
            let outcome = hook.await;
            {
                let mut state = this.inner.state.lock();
                state.final_in_flight = false;
                state.final_done = outcome.is_ok();
            }
            if let Err(err) = outcome {
                this.destroy(Some(err));
            }
            this.settle();
        }));
    }

    fn settle(&self) {
        if self.is_destroyed() {
            self.maybe_close();
        } else {
            self.schedule();
        }
    }

    fn maybe_auto_destroy(&self) {
        let kind = self.inner.kind;
        let done = {
            let state = self.inner.state.lock();
            (!kind.is_readable() || state.end_emitted)
                && (!kind.is_writable() || state.finish_emitted)
        };
        if done {
            self.destroy(None);
        }
    }

    fn maybe_close(&self) {
        let error = {
            let mut state = self.inner.state.lock();
            if !state.destroying
                || !state.destroy_hook_done
                || state.reading
                || state.writing
                || state.final_in_flight
                || state.closed
            {
                return;
            }
            state.closed = true;
            state.error.clone()
        };
        if let Some(err) = &error {
            self.emit(&Event::Error(err));
        }
        self.emit(&Event::Close);
        trace!(stream = self.inner.id, "push stream closed");
        let terminal = error
            .clone()
            .unwrap_or_else(|| StreamError::from(BridgeError::Destroyed));
        self.inner.ended.complete(Err(terminal.clone()));
        self.inner.finished.complete(Err(terminal));
        self.inner.closed.complete(error);
        self.inner.listeners.lock().clear();
    }
}

impl fmt::Debug for PushStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PushStream")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("flowing", &state.flowing)
            .field("buffered", &state.buffered)
            .field("queued", &state.queued)
            .field("destroying", &state.destroying)
            .field("closed", &state.closed)
            .finish()
    }
}
