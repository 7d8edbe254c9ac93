//! Hooks a push stream calls to produce and consume data.

use std::collections::VecDeque;
use std::fmt;

use futures_lite::future::{self, Boxed};
use parking_lot::Mutex;

use super::PushStream;
use crate::chunk::Chunk;
use crate::error::{BridgeError, StreamError};

/// Future returned by every hook.
pub type HookFuture = Boxed<Result<(), StreamError>>;

/// Returns a hook future that has already succeeded.
#[must_use]
pub fn done() -> HookFuture {
    Box::pin(future::ready(Ok(())))
}

/// Returns a hook future that has already failed.
#[must_use]
pub fn fail(err: impl Into<StreamError>) -> HookFuture {
    Box::pin(future::ready(Err(err.into())))
}

/// The producer/consumer half of a push stream.
///
/// The stream calls hooks one at a time per side: at most one `read` and at most
/// one `write` is ever in flight. A hook that fails destroys the stream with its
/// error. Every method has a default, so implementors override only the sides
/// they support.
pub trait PushBehavior: Send + Sync + 'static {
    /// Asked for more data. Produce it with [`PushStream::push`]; push `None` at end.
    fn read(&self, stream: &PushStream) -> HookFuture {
        let _ = stream;
        done()
    }

    /// Consumes one written chunk.
    fn write(&self, stream: &PushStream, chunk: Chunk) -> HookFuture {
        let _ = (stream, chunk);
        fail(BridgeError::NotWritable)
    }

    /// Runs once after `end` when every queued write has been consumed.
    fn finalize(&self, stream: &PushStream) -> HookFuture {
        let _ = stream;
        done()
    }

    /// Runs once when the stream is destroyed, before `Close` is emitted.
    fn destroy(&self, stream: &PushStream, error: Option<&StreamError>) -> HookFuture {
        let _ = (stream, error);
        done()
    }
}

type ReadFn = Box<dyn Fn(&PushStream) -> HookFuture + Send + Sync>;
type WriteFn = Box<dyn Fn(&PushStream, Chunk) -> HookFuture + Send + Sync>;
type DestroyFn = Box<dyn Fn(&PushStream, Option<&StreamError>) -> HookFuture + Send + Sync>;

/// A [`PushBehavior`] assembled from closures.
///
/// ```
/// use std::sync::Arc;
/// use parking_lot::Mutex;
/// use flowbridge::push::{FnBehavior, PushKind, PushStream, done};
/// use flowbridge::PushOptions;
///
/// let sink = Arc::new(Mutex::new(Vec::new()));
/// let seen = Arc::clone(&sink);
/// let behavior = FnBehavior::new().on_write(move |_, chunk| {
///     seen.lock().extend_from_slice(chunk.as_bytes());
///     done()
/// });
/// let stream = PushStream::new(PushKind::Writable, behavior, PushOptions::default());
/// assert!(stream.is_writable());
/// ```
#[derive(Default)]
pub struct FnBehavior {
    read: Option<ReadFn>,
    write: Option<WriteFn>,
    finalize: Option<ReadFn>,
    destroy: Option<DestroyFn>,
}

impl FnBehavior {
    /// Creates a behavior with every hook at its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the read hook.
    #[must_use]
    pub fn on_read<F>(mut self, f: F) -> Self
    where
        F: Fn(&PushStream) -> HookFuture + Send + Sync + 'static,
    {
        self.read = Some(Box::new(f));
        self
    }

    /// Sets the write hook.
    #[must_use]
    pub fn on_write<F>(mut self, f: F) -> Self
    where
        F: Fn(&PushStream, Chunk) -> HookFuture + Send + Sync + 'static,
    {
        self.write = Some(Box::new(f));
        self
    }

    /// Sets the final hook.
    #[must_use]
    pub fn on_final<F>(mut self, f: F) -> Self
    where
        F: Fn(&PushStream) -> HookFuture + Send + Sync + 'static,
    {
        self.finalize = Some(Box::new(f));
        self
    }

    /// Sets the destroy hook.
    #[must_use]
    pub fn on_destroy<F>(mut self, f: F) -> Self
    where
        F: Fn(&PushStream, Option<&StreamError>) -> HookFuture + Send + Sync + 'static,
    {
        self.destroy = Some(Box::new(f));
        self
    }
}

impl PushBehavior for FnBehavior {
    fn read(&self, stream: &PushStream) -> HookFuture {
        self.read.as_ref().map_or_else(done, |f| f(stream))
    }

    fn write(&self, stream: &PushStream, chunk: Chunk) -> HookFuture {
        match &self.write {
            Some(f) => f(stream, chunk),
            None => fail(BridgeError::NotWritable),
        }
    }

    fn finalize(&self, stream: &PushStream) -> HookFuture {
        self.finalize.as_ref().map_or_else(done, |f| f(stream))
    }

    fn destroy(&self, stream: &PushStream, error: Option<&StreamError>) -> HookFuture {
        self.destroy.as_ref().map_or_else(done, |f| f(stream, error))
    }
}

impl fmt::Debug for FnBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnBehavior")
            .field("read", &self.read.is_some())
            .field("write", &self.write.is_some())
            .field("finalize", &self.finalize.is_some())
            .field("destroy", &self.destroy.is_some())
            .finish()
    }
}

/// Read hook that pushes a fixed sequence of chunks, one per call, then ends.
#[derive(Debug, Default)]
pub struct ChunkSource {
    remaining: Mutex<VecDeque<Chunk>>,
}

impl ChunkSource {
    /// Creates a source over `chunks`.
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Chunk>,
    {
        Self {
            remaining: Mutex::new(chunks.into_iter().map(Into::into).collect()),
        }
    }
}

impl PushBehavior for ChunkSource {
    fn read(&self, stream: &PushStream) -> HookFuture {
        let next = self.remaining.lock().pop_front();
        stream.push(next);
        done()
    }
}
