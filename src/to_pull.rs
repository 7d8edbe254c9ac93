//! Push streams presented as pull streams.
//!
//! [`to_pull`] wraps the readable side of a push stream in a [`ReadableStream`]
//! and its writable side in a [`WritableStream`]:
//!
//! - Reading is rate-matched. The push stream stays paused until the readable
//!   pulls; each pull resumes it for one `Data` event, after which it is paused
//!   again.
//! - Writing honors push backpressure. A write that the push stream answers
//!   with `false` is not accepted until the stream has drained.
//! - Errors are relayed as the same [`StreamError`] object in both directions.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_lite::future;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::chunk::Chunk;
use crate::classify::{ReadSide, StreamLike, WriteCallback, WriteSide, resolve};
use crate::config::ToPullOptions;
use crate::drain::drained;
use crate::error::{BridgeError, StreamError};
use crate::pull::{
    PullFuture, ReadableController, ReadableStream, UnderlyingSink, UnderlyingSource,
    WritableStream, resolved,
};
use crate::push::{Event, EventKind, ListenerId, PushStream, WeakPushStream};
use crate::runtime;
use crate::sync::{Completion, Wait};
use crate::tracing_compat::{debug, trace};

/// Whether a read/write pair is a duplex or a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairKind {
    /// Independent read and write sides.
    Duplex,
    /// Output derives from input.
    Transform,
}

/// A readable and a writable bound to one logical connection.
#[derive(Clone)]
pub struct PullPair {
    /// Read side.
    pub readable: ReadableStream,
    /// Write side.
    pub writable: WritableStream,
    kind: PairKind,
    completion: Option<DuplexCompletion>,
}

impl PullPair {
    /// Pairs two pull streams as a duplex.
    #[must_use]
    pub const fn new(readable: ReadableStream, writable: WritableStream) -> Self {
        Self {
            readable,
            writable,
            kind: PairKind::Duplex,
            completion: None,
        }
    }

    /// Duplex or transform.
    #[must_use]
    pub const fn kind(&self) -> PairKind {
        self.kind
    }

    /// End-of-connection signal, present when both sides wrap push streams.
    #[must_use]
    pub const fn completion(&self) -> Option<&DuplexCompletion> {
        self.completion.as_ref()
    }
}

impl fmt::Debug for PullPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullPair")
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// What [`to_pull`] produced.
#[derive(Debug, Clone)]
pub enum PullEndpoint {
    /// The input was readable only.
    Readable(ReadableStream),
    /// The input was writable only.
    Writable(WritableStream),
    /// The input had both sides.
    Pair(PullPair),
}

impl PullEndpoint {
    /// The readable side, if any.
    #[must_use]
    pub fn readable(&self) -> Option<&ReadableStream> {
        match self {
            Self::Readable(stream) => Some(stream),
            Self::Pair(pair) => Some(&pair.readable),
            Self::Writable(_) => None,
        }
    }

    /// The writable side, if any.
    #[must_use]
    pub fn writable(&self) -> Option<&WritableStream> {
        match self {
            Self::Writable(stream) => Some(stream),
            Self::Pair(pair) => Some(&pair.writable),
            Self::Readable(_) => None,
        }
    }

    /// Returns the readable, failing if the input had none.
    pub fn into_readable(self) -> Result<ReadableStream, BridgeError> {
        match self {
            Self::Readable(stream) => Ok(stream),
            Self::Pair(pair) => Ok(pair.readable),
            Self::Writable(_) => Err(BridgeError::InvalidStream("no readable side")),
        }
    }

    /// Returns the writable, failing if the input had none.
    pub fn into_writable(self) -> Result<WritableStream, BridgeError> {
        match self {
            Self::Writable(stream) => Ok(stream),
            Self::Pair(pair) => Ok(pair.writable),
            Self::Readable(_) => Err(BridgeError::InvalidStream("no writable side")),
        }
    }

    /// Returns the pair, failing unless the input had both sides.
    pub fn into_pair(self) -> Result<PullPair, BridgeError> {
        match self {
            Self::Pair(pair) => Ok(pair),
            _ => Err(BridgeError::InvalidStream("not a read/write pair")),
        }
    }
}

impl From<PullEndpoint> for StreamLike {
    fn from(endpoint: PullEndpoint) -> Self {
        match endpoint {
            PullEndpoint::Readable(stream) => Self::PullReadable(stream),
            PullEndpoint::Writable(stream) => Self::PullWritable(stream),
            PullEndpoint::Pair(pair) => Self::PullDuplex(pair),
        }
    }
}

/// Listeners installed on a push stream while it feeds a pull readable.
///
/// Populated once at start and torn down at most once; every teardown path
/// after the first is a no-op.
#[derive(Debug, Default)]
pub struct EventSubscriptionSet {
    ids: Mutex<SmallVec<[ListenerId; 4]>>,
    torn_down: AtomicBool,
}

impl EventSubscriptionSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` on `stream` unless the set is torn down.
    pub fn subscribe<F>(&self, stream: &PushStream, kind: EventKind, listener: F)
    where
        F: Fn(&Event<'_>) + Send + Sync + 'static,
    {
        let mut ids = self.ids.lock();
        if self.is_torn_down() {
            return;
        }
        ids.push(stream.on(kind, listener));
    }

    /// Removes every listener. Returns `false` if already torn down.
    pub fn teardown(&self, stream: &PushStream) -> bool {
        let ids = {
            let mut ids = self.ids.lock();
            if self.torn_down.swap(true, Ordering::AcqRel) {
                return false;
            }
            std::mem::take(&mut *ids)
        };
        trace!(stream = stream.id(), listeners = ids.len(), "unsubscribing");
        for id in ids {
            stream.off(id);
        }
        true
    }

    /// Returns `true` once torn down.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    /// Returns `true` when nothing is subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source feeding a pull readable from a push stream's events.
struct PushReadableSource {
    stream: PushStream,
    subscriptions: Arc<EventSubscriptionSet>,
}

impl PushReadableSource {
    fn new(stream: PushStream) -> Self {
        Self {
            stream,
            subscriptions: Arc::new(EventSubscriptionSet::new()),
        }
    }
}

impl UnderlyingSource for PushReadableSource {
    fn start(&self, controller: &ReadableController) -> PullFuture {
        let stream = &self.stream;
        let set = &self.subscriptions;
        debug!(stream = stream.id(), "bridging push readable");

        let (ctrl, subs, weak) = (controller.clone(), Arc::clone(set), stream.downgrade());
        set.subscribe(stream, EventKind::Data, move |event| {
            let Event::Data(chunk) = event else { return };
            if subs.is_torn_down() {
                return;
            }
            if let Err(err) = ctrl.enqueue(Chunk::clone(chunk)) {
                trace!(error = %err, "enqueue rejected");
            }
            if let Some(stream) = weak.upgrade() {
                stream.pause();
            }
        });

        for kind in [EventKind::End, EventKind::Close] {
            let (ctrl, subs, weak) = (controller.clone(), Arc::clone(set), stream.downgrade());
            set.subscribe(stream, kind, move |_| {
                if finish(&subs, &weak) {
                    // Already closed by the consumer: nothing left to signal.
                    let _ = ctrl.close();
                }
            });
        }

        let (ctrl, subs, weak) = (controller.clone(), Arc::clone(set), stream.downgrade());
        set.subscribe(stream, EventKind::Error, move |event| {
            let Event::Error(err) = event else { return };
            if finish(&subs, &weak) {
                debug!(error = %err, "relaying push error to readable");
                ctrl.error(StreamError::clone(err));
            }
        });

        stream.pause();
        resolved()
    }

    fn pull(&self, _controller: &ReadableController) -> PullFuture {
        if !self.subscriptions.is_torn_down() {
            self.stream.resume();
        }
        resolved()
    }

    fn cancel(&self, reason: Option<StreamError>) -> PullFuture {
        debug!(
            stream = self.stream.id(),
            reason = ?reason.as_ref().map(ToString::to_string),
            "readable cancelled, destroying push source"
        );
        self.subscriptions.teardown(&self.stream);
        self.stream.push(None);
        self.stream.pause();
        self.stream.destroy(None);
        resolved()
    }
}

fn finish(subscriptions: &EventSubscriptionSet, stream: &WeakPushStream) -> bool {
    stream
        .upgrade()
        .is_some_and(|stream| subscriptions.teardown(&stream))
}

/// Sink forwarding pull writes into a push stream.
#[derive(Clone)]
struct PushWritableSink {
    target: PushStream,
    /// Readable push stream that also learns about write failures.
    raise_on: Option<WeakPushStream>,
}

impl PushWritableSink {
    fn fail(&self, err: &StreamError) {
        debug!(stream = self.target.id(), error = %err, "push write failed");
        self.target.destroy(Some(err.clone()));
        if let Some(readable) = self.raise_on.clone() {
            let err = err.clone();
            runtime::defer(move || {
                if let Some(readable) = readable.upgrade() {
                    readable.emit_error(&err);
                }
            });
        }
    }
}

impl UnderlyingSink for PushWritableSink {
    fn write(&self, chunk: Vec<u8>) -> PullFuture {
        let this = self.clone();
        Box::pin(async move {
            let outcome = match this.target.write(chunk) {
                Ok(true) => Ok(()),
                Ok(false) => {
                    trace!(stream = this.target.id(), "write backpressured");
                    if drained(&this.target, false).await {
                        Ok(())
                    } else {
                        Err(this
                            .target
                            .error()
                            .unwrap_or_else(|| BridgeError::Destroyed.into()))
                    }
                }
                Err(err) => Err(err),
            };
            if let Err(err) = &outcome {
                this.fail(err);
            }
            outcome
        })
    }

    fn close(&self) -> PullFuture {
        let target = self.target.clone();
        Box::pin(async move {
            target.end();
            target.finished().await
        })
    }

    fn abort(&self, reason: Option<StreamError>) -> PullFuture {
        match &reason {
            Some(err) => self.fail(err),
            None => self.target.destroy(None),
        }
        resolved()
    }
}

/// Sink calling a write function per chunk.
struct CallbackSink(WriteCallback);

impl UnderlyingSink for CallbackSink {
    fn write(&self, chunk: Vec<u8>) -> PullFuture {
        (self.0)(chunk)
    }
}

/// Resolves once a bridged duplex has ended on the read side and finished on
/// the write side, or with the first error that cut it short.
#[derive(Clone, Debug)]
pub struct DuplexCompletion {
    signal: Completion<Result<(), StreamError>>,
}

impl DuplexCompletion {
    fn watch(readable: &PushStream, writable: &PushStream) -> Self {
        let signal = Completion::new();
        let ended = readable.ended();
        let finished = writable.finished();
        let write_closed = writable.closed();
        let done = signal.clone();
        drop(runtime::spawn(async move {
            let natural = async move {
                ended.await?;
                finished.await
            };
            let short_circuit = async move {
                match write_closed.await {
                    Some(err) => Err(err),
                    None => future::pending().await,
                }
            };
            done.complete(future::or(natural, short_circuit).await);
        }));
        Self { signal }
    }

    /// Waits for the connection to complete.
    pub fn wait(&self) -> Wait<Result<(), StreamError>> {
        self.signal.wait()
    }

    /// Returns `true` once settled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.signal.is_complete()
    }
}

/// Presents a push stream (or a descriptor) as pull streams.
///
/// Pull endpoints found in a descriptor pass through unchanged, and a write
/// callback becomes the sink of a new writable.
///
/// # Errors
///
/// [`BridgeError::InvalidStream`] when `input` has no usable capability.
pub fn to_pull(
    input: impl Into<StreamLike>,
    options: ToPullOptions,
) -> Result<PullEndpoint, BridgeError> {
    let input = input.into();
    let resolved = resolve(&input)?;

    let readable_push = match &resolved.readable {
        Some(ReadSide::Push(stream)) => Some(stream.clone()),
        _ => None,
    };
    let readable = resolved.readable.map(|side| match side {
        ReadSide::Push(stream) => ReadableStream::with_high_water_mark(
            Arc::new(PushReadableSource::new(stream)),
            options.mode,
            options.effective_readable_high_water_mark(),
        ),
        ReadSide::Pull(stream) => stream,
    });

    let mut writable_push = None;
    let writable = resolved.writable.map(|side| match side {
        WriteSide::Push(target) => {
            let raise_on = readable_push
                .as_ref()
                .filter(|readable| !PushStream::ptr_eq(readable, &target))
                .map(PushStream::downgrade);
            writable_push = Some(target.clone());
            WritableStream::new(
                PushWritableSink { target, raise_on },
                options.writable_high_water_mark,
            )
        }
        WriteSide::Pull(stream) => stream,
        WriteSide::Callback(callback) => {
            WritableStream::new(CallbackSink(callback), options.writable_high_water_mark)
        }
    });

    let endpoint = match (readable, writable) {
        (Some(readable), Some(writable)) => {
            let completion = readable_push
                .as_ref()
                .zip(writable_push.as_ref())
                .map(|(r, w)| DuplexCompletion::watch(r, w));
            let kind = if options.as_transform {
                PairKind::Transform
            } else {
                PairKind::Duplex
            };
            PullEndpoint::Pair(PullPair {
                readable,
                writable,
                kind,
                completion,
            })
        }
        (Some(readable), None) => PullEndpoint::Readable(readable),
        (None, Some(writable)) => PullEndpoint::Writable(writable),
        (None, None) => return Err(BridgeError::InvalidStream("no usable capability")),
    };
    debug!(mode = %options.mode, "to_pull adapter created");
    Ok(endpoint)
}
