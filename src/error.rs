//! Error types for the stream bridge.
//!
//! Two layers live here:
//!
//! - [`StreamError`] is the value that travels *through* streams: the payload of a
//!   push-stream `Error` event and the rejection of a pull-stream read or write.
//!   It is shared, never copied. Every relay clones the same allocation, so a
//!   consumer can check that the error it observed is the one the producer raised
//!   with [`StreamError::same`].
//! - [`BridgeError`] is the crate's own taxonomy for failures the adapters detect
//!   themselves (no usable capability, lock misuse, writes after end).
//!
//! A `BridgeError` converts into a `StreamError` when it has to travel through a
//! stream; the reverse never happens on a relay path.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A shared, identity-preserving stream error.
///
/// Cloning a `StreamError` is cheap and yields a handle to the same underlying
/// error object.
///
/// # Example
///
/// ```
/// use flowbridge::StreamError;
///
/// let original = StreamError::msg("socket reset");
/// let relayed = original.clone();
/// assert!(StreamError::same(&original, &relayed));
/// assert!(!StreamError::same(&original, &StreamError::msg("socket reset")));
/// ```
#[derive(Clone)]
pub struct StreamError {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

impl StreamError {
    /// Wraps an arbitrary error.
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(err),
        }
    }

    /// Creates an error carrying only a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Returns `true` if both handles refer to the same error object.
    #[must_use]
    pub fn same(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Returns `true` if the wrapped error is of type `E`.
    #[must_use]
    pub fn is<E: StdError + 'static>(&self) -> bool {
        self.inner.is::<E>()
    }

    /// Attempts to view the wrapped error as `E`.
    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        self.inner.downcast_ref::<E>()
    }

    /// Returns the wrapped [`BridgeError`], if this error originated in the bridge.
    #[must_use]
    pub fn as_bridge(&self) -> Option<&BridgeError> {
        self.downcast_ref::<BridgeError>()
    }

    /// Returns `true` if this error reports a released lock.
    #[must_use]
    pub fn is_released(&self) -> bool {
        matches!(self.as_bridge(), Some(BridgeError::Released))
    }
}

impl fmt::Debug for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StreamError").field(&self.inner).finish()
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

impl StdError for StreamError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

impl From<BridgeError> for StreamError {
    fn from(err: BridgeError) -> Self {
        Self::new(err)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

/// Which side of an adapter holds a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockSide {
    /// The exclusive reader lock on a pull-stream readable.
    Reader,
    /// The exclusive writer lock on a pull-stream writable.
    Writer,
}

impl fmt::Display for LockSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader => f.write_str("reader"),
            Self::Writer => f.write_str("writer"),
        }
    }
}

/// Operations guarded by the single-outstanding-operation invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// A pull-stream read request.
    Read,
    /// A pull-stream write request.
    Write,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Failures detected by the bridge itself.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// No readable or writable capability could be found in the input.
    ///
    /// Raised synchronously at adapter construction and never retried.
    #[error("invalid stream: {0}")]
    InvalidStream(&'static str),
    /// The wrapped stream failed while a read was outstanding.
    #[error("upstream read failed: {0}")]
    UpstreamRead(StreamError),
    /// The wrapped stream failed while a write was outstanding.
    #[error("upstream write failed: {0}")]
    UpstreamWrite(StreamError),
    /// Releasing a reader or writer lock failed during teardown.
    #[error("failed to release {side} lock: {source}")]
    LockRelease {
        /// The lock that could not be released.
        side: LockSide,
        /// Why the release failed.
        source: StreamError,
    },
    /// A second outstanding operation was attempted before the first settled.
    #[error("a {0} is already outstanding")]
    OperationInProgress(OperationKind),
    /// The stream is already locked to another reader or writer.
    #[error("stream is locked to another reader or writer")]
    Locked,
    /// The reader or writer lock has been released.
    #[error("lock has been released")]
    Released,
    /// The stream has no usable write capability.
    #[error("stream is not writable")]
    NotWritable,
    /// A write was attempted after end-of-input was signalled.
    #[error("write after end")]
    WriteAfterEnd,
    /// The stream was destroyed.
    #[error("stream was destroyed")]
    Destroyed,
    /// The stream is closed or closing.
    #[error("stream is closed")]
    Closed,
}

impl BridgeError {
    /// Returns the upstream error carried by this error, if any.
    #[must_use]
    pub fn upstream(&self) -> Option<&StreamError> {
        match self {
            Self::UpstreamRead(err) | Self::UpstreamWrite(err) => Some(err),
            Self::LockRelease { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Classifies an error observed on a read path.
    ///
    /// Bridge errors pass through unchanged; anything else is an upstream read failure.
    /// The wrapped `StreamError` keeps its identity.
    #[must_use]
    pub fn classify_read(err: &StreamError) -> Self {
        err.as_bridge()
            .cloned()
            .unwrap_or_else(|| Self::UpstreamRead(err.clone()))
    }

    /// Classifies an error observed on a write path.
    #[must_use]
    pub fn classify_write(err: &StreamError) -> Self {
        err.as_bridge()
            .cloned()
            .unwrap_or_else(|| Self::UpstreamWrite(err.clone()))
    }

    /// Returns `true` for construction-time capability failures.
    #[must_use]
    pub const fn is_invalid_stream(&self) -> bool {
        matches!(self, Self::InvalidStream(_))
    }
}
