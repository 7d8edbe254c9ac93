//! Consumer-driven pull streams.
//!
//! [`ReadableStream`] asks its [`UnderlyingSource`] for data through `pull` when
//! its queue runs below the high water mark or a read is waiting.
//! [`WritableStream`] feeds chunks to its [`UnderlyingSink`] one at a time and
//! reports backpressure through the writer's `ready` signal.
//!
//! Both streams hand out at most one exclusive lock holder (a reader or a
//! writer). Releasing the lock settles everything the holder was waiting on with
//! [`BridgeError::Released`](crate::BridgeError::Released).
//!
//! Source and sink callbacks are invoked without any stream lock held, and `pull`
//! is never re-entered: a request that arrives while a pull is in progress only
//! marks that another pull is needed.

mod readable;
mod writable;

pub use readable::{
    ChunksSource, ReadFuture, ReadResult, ReadableController, ReadableReader, ReadableStream,
    UnderlyingSource,
};
pub use writable::{CollectSink, UnderlyingSink, WritableStream, WritableWriter};

use futures_lite::future::{self, Boxed};

use crate::error::StreamError;

/// Future returned by source and sink callbacks.
pub type PullFuture = Boxed<Result<(), StreamError>>;

/// A callback future that has already succeeded.
#[must_use]
pub fn resolved() -> PullFuture {
    Box::pin(future::ready(Ok(())))
}

/// Lifecycle state of a pull stream.
#[derive(Debug, Clone)]
pub enum StreamState {
    /// Open for reads or writes.
    Open,
    /// Closed normally.
    Closed,
    /// Failed with the contained error.
    Errored(StreamError),
}

impl StreamState {
    /// Returns `true` while open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Returns `true` once closed normally.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// The stored error, if errored.
    #[must_use]
    pub const fn error(&self) -> Option<&StreamError> {
        match self {
            Self::Errored(err) => Some(err),
            _ => None,
        }
    }
}
