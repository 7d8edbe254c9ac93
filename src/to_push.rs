//! Pull streams presented as push streams.
//!
//! [`to_push`] locks the input's readable (and writable, if any) and returns a
//! [`PullBackedStream`]: a [`PushStream`] whose hooks read from and write to
//! those locks.
//!
//! - The read hook issues exactly one pull read at a time.
//! - The write hook waits for writer readiness before each write.
//! - [`PullBackedStream::close`] hands the locks back without closing the pull
//!   streams; the caller keeps ownership of them.
//!
//! Once released, the adapter reports end of data to its readers and turns
//! writes into no-ops, so nothing crosses the boundary after a release starts.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::chunk::Chunk;
use crate::classify::{ReadSide, StreamLike, WriteCallback, WriteSide, resolve};
use crate::config::{ToPushOptions, WriteOverride};
use crate::error::{BridgeError, OperationKind, StreamError};
use crate::lifecycle::{LockLease, PendingOperation, release_in_order};
use crate::pull::{ReadableReader, ReadableStream, WritableStream, WritableWriter};
use crate::push::{HookFuture, PushBehavior, PushKind, PushStream, WeakPushStream, done, fail};
use crate::runtime;
use crate::tracing_compat::{debug, trace};

/// Lock state shared by the hooks of one adapted stream.
pub struct PullAdapter {
    reader: Option<LockLease<ReadableReader>>,
    writer: Option<LockLease<WritableWriter>>,
    callback: Option<WriteCallback>,
    released: AtomicBool,
    bytes_read: AtomicU64,
    pending_read: PendingOperation,
    pending_write: PendingOperation,
    close_writable_on_final: bool,
}

impl PullAdapter {
    /// Returns `true` once the locks are being, or have been, handed back.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Bytes forwarded downstream so far.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    async fn read_into(&self, stream: &PushStream) -> Result<(), StreamError> {
        let reader = match self.reader.as_ref().and_then(LockLease::get) {
            Some(reader) if !self.is_released() => reader,
            _ => {
                stream.push(None);
                return Ok(());
            }
        };
        match self.pending_read.track(reader.read())?.await {
            Ok(Some(bytes)) if !self.is_released() => {
                let len = bytes.len() as u64;
                self.bytes_read.fetch_add(len, Ordering::AcqRel);
                trace!(stream = stream.id(), len, "forwarding chunk");
                stream.push(Some(Chunk::Bytes(bytes)));
                Ok(())
            }
            Ok(_) => {
                stream.push(None);
                Ok(())
            }
            Err(err) if err.is_released() && self.is_released() => {
                stream.push(None);
                Ok(())
            }
            Err(err) => {
                debug!(stream = stream.id(), error = %err, "pull read failed");
                Err(err)
            }
        }
    }

    async fn write_from(&self, stream: &PushStream, chunk: Chunk) -> Result<(), StreamError> {
        if !stream.is_writable() {
            return Err(BridgeError::NotWritable.into());
        }
        if let Some(callback) = &self.callback {
            if self.is_released() || stream.is_destroyed() {
                return Ok(());
            }
            return self.pending_write.track(callback(chunk.into_bytes()))?.await;
        }
        let Some(lease) = &self.writer else {
            return Err(BridgeError::NotWritable.into());
        };
        let Some(writer) = lease.get() else {
            return Ok(());
        };
        match writer.ready().await {
            Err(err) if err.is_released() => return Ok(()),
            Err(err) => return Err(err),
            Ok(()) => {}
        }
        if stream.is_destroyed() || self.is_released() {
            trace!(stream = stream.id(), "write skipped after release");
            return Ok(());
        }
        self.pending_write.track(writer.write(chunk))?.await
    }

    async fn finalize(&self) -> Result<(), StreamError> {
        if !self.close_writable_on_final {
            return Ok(());
        }
        let Some(writer) = self.writer.as_ref().and_then(LockLease::get) else {
            return Ok(());
        };
        match writer.close().await {
            Err(err) if err.is_released() => Ok(()),
            outcome => outcome,
        }
    }

    /// Releases both leases at once. Used when the push stream is destroyed.
    fn release_now(&self) -> Result<(), StreamError> {
        self.released.store(true, Ordering::Release);
        let writer = self.writer.as_ref().map_or(Ok(false), LockLease::release);
        let reader = self.reader.as_ref().map_or(Ok(false), LockLease::release);
        writer.and(reader).map(drop).map_err(StreamError::from)
    }

    async fn release(&self, stream: &PushStream) -> Result<(), BridgeError> {
        if self.released.swap(true, Ordering::AcqRel) {
            trace!(stream = stream.id(), "adapter already released");
            return Ok(());
        }
        debug!(stream = stream.id(), "releasing adapter locks");
        let flush = stream.finished();
        let outcome = release_in_order(
            self.writer.as_ref(),
            flush,
            self.reader.as_ref().map(|reader| (reader, &self.pending_read)),
        )
        .await;
        debug!(stream = stream.id(), ok = outcome.is_ok(), "adapter released");
        outcome
    }
}

impl fmt::Debug for PullAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullAdapter")
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .field("callback", &self.callback.is_some())
            .field("released", &self.is_released())
            .field("bytes_read", &self.bytes_read())
            .finish_non_exhaustive()
    }
}

struct AdapterBehavior {
    adapter: Arc<PullAdapter>,
}

impl PushBehavior for AdapterBehavior {
    fn read(&self, stream: &PushStream) -> HookFuture {
        let adapter = Arc::clone(&self.adapter);
        let stream = stream.clone();
        Box::pin(async move { adapter.read_into(&stream).await })
    }

    fn write(&self, stream: &PushStream, chunk: Chunk) -> HookFuture {
        let adapter = Arc::clone(&self.adapter);
        let stream = stream.clone();
        Box::pin(async move { adapter.write_from(&stream, chunk).await })
    }

    fn finalize(&self, _stream: &PushStream) -> HookFuture {
        let adapter = Arc::clone(&self.adapter);
        Box::pin(async move { adapter.finalize().await })
    }

    fn destroy(&self, stream: &PushStream, _error: Option<&StreamError>) -> HookFuture {
        trace!(stream = stream.id(), "adapter destroyed, dropping locks");
        match self.adapter.release_now() {
            Ok(()) => done(),
            Err(err) => fail(err),
        }
    }
}

/// A push stream backed by pull stream locks.
///
/// Dereferences to the underlying [`PushStream`].
#[derive(Clone)]
pub struct PullBackedStream {
    stream: PushStream,
    adapter: Arc<PullAdapter>,
}

impl PullBackedStream {
    /// The push stream.
    #[must_use]
    pub fn stream(&self) -> &PushStream {
        &self.stream
    }

    /// Consumes the wrapper, returning the push stream.
    #[must_use]
    pub fn into_stream(self) -> PushStream {
        self.stream
    }

    /// Bytes read from the pull readable and forwarded downstream.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.adapter.bytes_read()
    }

    /// Returns `true` once [`close`](Self::close) started or the stream was
    /// destroyed.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.adapter.is_released()
    }

    /// The lock state behind the hooks.
    #[must_use]
    pub fn adapter(&self) -> &PullAdapter {
        &self.adapter
    }

    /// Hands the pull locks back after in-flight operations settle.
    ///
    /// Queued writes are flushed first, so this waits for the push stream to
    /// finish when a writer is held. The pull streams stay open. Calling it
    /// again is a no-op.
    ///
    /// # Errors
    ///
    /// The first failure seen while releasing; the remaining steps still run.
    pub async fn close(&self) -> Result<(), BridgeError> {
        self.adapter.release(&self.stream).await
    }
}

impl Deref for PullBackedStream {
    type Target = PushStream;

    fn deref(&self) -> &PushStream {
        &self.stream
    }
}

impl fmt::Debug for PullBackedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullBackedStream")
            .field("stream", &self.stream)
            .field("adapter", &self.adapter)
            .finish()
    }
}

/// Surfaces an unexpected failure of a lock's `closed` signal on the stream.
fn watch_closed<F>(closed: F, stream: WeakPushStream)
where
    F: std::future::Future<Output = Result<(), StreamError>> + 'static,
{
    drop(runtime::spawn(async move {
        if let Err(err) = closed.await {
            if err.is_released() {
                return;
            }
            if let Some(stream) = stream.upgrade() {
                debug!(stream = stream.id(), error = %err, "pull stream failed underneath adapter");
                stream.destroy(Some(err));
            }
        }
    }));
}

/// Presents a pull stream (or a descriptor) as a push stream.
///
/// A write capability in the input takes precedence over
/// [`ToPushOptions::write`]. Input with only a write capability yields a
/// writable-only push stream.
///
/// # Errors
///
/// - [`BridgeError::InvalidStream`] when `input` is itself a push stream or
///   has no usable pull capability.
/// - [`BridgeError::Locked`] when a pull stream is already locked.
pub fn to_push(
    input: impl Into<StreamLike>,
    options: ToPushOptions,
) -> Result<PullBackedStream, BridgeError> {
    let input = input.into();
    if matches!(input, StreamLike::Push(_)) {
        return Err(BridgeError::InvalidStream("input is already a push stream"));
    }
    let resolved = resolve(&input)?;

    let readable: Option<ReadableStream> = match resolved.readable {
        Some(ReadSide::Pull(stream)) => Some(stream),
        Some(ReadSide::Push(_)) => {
            return Err(BridgeError::InvalidStream("readable side is a push stream"));
        }
        None => None,
    };
    let write = match resolved.writable {
        Some(WriteSide::Pull(stream)) => Some(WriteOverride::Stream(stream)),
        Some(WriteSide::Callback(callback)) => Some(WriteOverride::Callback(callback)),
        Some(WriteSide::Push(_)) => {
            return Err(BridgeError::InvalidStream("writable side is a push stream"));
        }
        None => options.write.clone(),
    };
    let kind = match (readable.is_some(), write.is_some()) {
        (true, true) if options.as_transform => PushKind::Transform,
        (true, true) => PushKind::Duplex,
        (true, false) => PushKind::Readable,
        (false, true) => PushKind::Writable,
        (false, false) => return Err(BridgeError::InvalidStream("no pull capability")),
    };

    let reader = readable
        .as_ref()
        .map(ReadableStream::get_reader)
        .transpose()?;
    let (writer, callback) = match write {
        Some(WriteOverride::Stream(stream)) => match stream.get_writer() {
            Ok(writer) => (Some(writer), None),
            Err(err) => {
                if let Some(reader) = &reader {
                    reader.release_lock()?;
                }
                return Err(err);
            }
        },
        Some(WriteOverride::Callback(callback)) => (None, Some(callback)),
        None => (None, None),
    };

    let reader_closed = reader.as_ref().map(ReadableReader::closed);
    let writer_closed = writer.as_ref().map(WritableWriter::closed);
    let adapter = Arc::new(PullAdapter {
        reader: reader.map(LockLease::new),
        writer: writer.map(LockLease::new),
        callback,
        released: AtomicBool::new(false),
        bytes_read: AtomicU64::new(0),
        pending_read: PendingOperation::new(OperationKind::Read),
        pending_write: PendingOperation::new(OperationKind::Write),
        close_writable_on_final: options.close_writable_on_final,
    });
    let stream = PushStream::with_behavior(
        kind,
        Arc::new(AdapterBehavior {
            adapter: Arc::clone(&adapter),
        }),
        options.push,
    );
    for closed in reader_closed.into_iter().chain(writer_closed) {
        watch_closed(closed, stream.downgrade());
    }
    debug!(stream = stream.id(), ?kind, "to_push adapter created");
    Ok(PullBackedStream { stream, adapter })
}
