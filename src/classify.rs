//! Stream classification.
//!
//! Adapters accept any [`StreamLike`]: a push stream, a pull readable or
//! writable, a pull read/write pair, or a loose [`StreamDescriptor`] bundling
//! endpoints in `readable`/`writable`/`duplex` slots. [`classify`] names what
//! was given; [`resolve`] extracts the usable read and write capabilities, and
//! is the only place that inspects the input's shape.
//!
//! Descriptor rules:
//!
//! - `readable` contributes a read capability, `writable` a write capability.
//!   An endpoint in the wrong slot (a pull writable under `readable`) counts as
//!   absent.
//! - When both `readable` and `writable` are absent, `duplex` serves both.
//! - No capability at all is [`BridgeError::InvalidStream`].

use std::fmt;
use std::sync::Arc;

use crate::error::BridgeError;
use crate::pull::{ReadableStream, WritableStream};
use crate::push::{HookFuture, PushKind, PushStream};
use crate::to_pull::PullPair;

/// A write capability given as a function, called once per chunk.
pub type WriteCallback = Arc<dyn Fn(Vec<u8>) -> HookFuture + Send + Sync>;

/// One endpoint inside a [`StreamDescriptor`].
#[derive(Clone)]
pub enum Endpoint {
    /// A push stream.
    Push(PushStream),
    /// A pull readable.
    PullReadable(ReadableStream),
    /// A pull writable.
    PullWritable(WritableStream),
    /// A pull read/write pair.
    PullDuplex(PullPair),
    /// A write function.
    Callback(WriteCallback),
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push(stream) => f.debug_tuple("Push").field(stream).finish(),
            Self::PullReadable(stream) => f.debug_tuple("PullReadable").field(stream).finish(),
            Self::PullWritable(stream) => f.debug_tuple("PullWritable").field(stream).finish(),
            Self::PullDuplex(pair) => f.debug_tuple("PullDuplex").field(pair).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

impl From<PushStream> for Endpoint {
    fn from(stream: PushStream) -> Self {
        Self::Push(stream)
    }
}

impl From<ReadableStream> for Endpoint {
    fn from(stream: ReadableStream) -> Self {
        Self::PullReadable(stream)
    }
}

impl From<WritableStream> for Endpoint {
    fn from(stream: WritableStream) -> Self {
        Self::PullWritable(stream)
    }
}

impl From<PullPair> for Endpoint {
    fn from(pair: PullPair) -> Self {
        Self::PullDuplex(pair)
    }
}

/// An object exposing endpoints through named slots.
#[derive(Debug, Clone, Default)]
pub struct StreamDescriptor {
    /// Read endpoint.
    pub readable: Option<Endpoint>,
    /// Write endpoint.
    pub writable: Option<Endpoint>,
    /// Endpoint used for both directions when the other slots are empty.
    pub duplex: Option<Endpoint>,
}

impl StreamDescriptor {
    /// An empty descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `readable` slot.
    #[must_use]
    pub fn readable(mut self, endpoint: impl Into<Endpoint>) -> Self {
        self.readable = Some(endpoint.into());
        self
    }

    /// Sets the `writable` slot.
    #[must_use]
    pub fn writable(mut self, endpoint: impl Into<Endpoint>) -> Self {
        self.writable = Some(endpoint.into());
        self
    }

    /// Sets the `writable` slot to a write function.
    #[must_use]
    pub fn write_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(Vec<u8>) -> HookFuture + Send + Sync + 'static,
    {
        self.writable = Some(Endpoint::Callback(Arc::new(callback)));
        self
    }

    /// Sets the `duplex` slot.
    #[must_use]
    pub fn duplex(mut self, endpoint: impl Into<Endpoint>) -> Self {
        self.duplex = Some(endpoint.into());
        self
    }
}

/// Anything an adapter accepts.
#[derive(Debug, Clone)]
pub enum StreamLike {
    /// A push stream.
    Push(PushStream),
    /// A pull readable.
    PullReadable(ReadableStream),
    /// A pull writable.
    PullWritable(WritableStream),
    /// A pull read/write pair.
    PullDuplex(PullPair),
    /// A loose descriptor.
    Descriptor(StreamDescriptor),
}

impl From<PushStream> for StreamLike {
    fn from(stream: PushStream) -> Self {
        Self::Push(stream)
    }
}

impl From<ReadableStream> for StreamLike {
    fn from(stream: ReadableStream) -> Self {
        Self::PullReadable(stream)
    }
}

impl From<WritableStream> for StreamLike {
    fn from(stream: WritableStream) -> Self {
        Self::PullWritable(stream)
    }
}

impl From<PullPair> for StreamLike {
    fn from(pair: PullPair) -> Self {
        Self::PullDuplex(pair)
    }
}

impl From<StreamDescriptor> for StreamLike {
    fn from(descriptor: StreamDescriptor) -> Self {
        Self::Descriptor(descriptor)
    }
}

/// What [`classify`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// A push stream with only a readable side.
    PushReadable,
    /// A push stream with only a writable side.
    PushWritable,
    /// A push stream with both sides.
    PushDuplex,
    /// A pull readable.
    PullReadable,
    /// A pull writable.
    PullWritable,
    /// A pull read/write pair.
    PullDuplex,
    /// A descriptor with at least one usable capability.
    Descriptor,
    /// Nothing usable.
    Invalid,
}

/// A resolved read capability.
#[derive(Debug, Clone)]
pub enum ReadSide {
    /// Read from a push stream's events.
    Push(PushStream),
    /// Read through a pull reader.
    Pull(ReadableStream),
}

/// A resolved write capability.
#[derive(Clone)]
pub enum WriteSide {
    /// Write into a push stream.
    Push(PushStream),
    /// Write through a pull writer.
    Pull(WritableStream),
    /// Call a function per chunk.
    Callback(WriteCallback),
}

impl fmt::Debug for WriteSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push(stream) => f.debug_tuple("Push").field(stream).finish(),
            Self::Pull(stream) => f.debug_tuple("Pull").field(stream).finish(),
            Self::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// Capabilities extracted from a [`StreamLike`].
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Where data can be read from.
    pub readable: Option<ReadSide>,
    /// Where data can be written to.
    pub writable: Option<WriteSide>,
}

impl Resolved {
    /// Returns `true` if both directions are available.
    #[must_use]
    pub const fn is_duplex(&self) -> bool {
        self.readable.is_some() && self.writable.is_some()
    }
}

fn read_capability(endpoint: &Endpoint) -> Option<ReadSide> {
    match endpoint {
        Endpoint::Push(stream) if stream.is_readable() => Some(ReadSide::Push(stream.clone())),
        Endpoint::PullReadable(stream) => Some(ReadSide::Pull(stream.clone())),
        Endpoint::PullDuplex(pair) => Some(ReadSide::Pull(pair.readable.clone())),
        _ => None,
    }
}

fn write_capability(endpoint: &Endpoint) -> Option<WriteSide> {
    match endpoint {
        Endpoint::Push(stream) if stream.is_writable() => Some(WriteSide::Push(stream.clone())),
        Endpoint::PullWritable(stream) => Some(WriteSide::Pull(stream.clone())),
        Endpoint::PullDuplex(pair) => Some(WriteSide::Pull(pair.writable.clone())),
        Endpoint::Callback(callback) => Some(WriteSide::Callback(Arc::clone(callback))),
        _ => None,
    }
}

fn descriptor_capabilities(descriptor: &StreamDescriptor) -> Resolved {
    if descriptor.readable.is_none() && descriptor.writable.is_none() {
        if let Some(duplex) = &descriptor.duplex {
            return Resolved {
                readable: read_capability(duplex),
                writable: write_capability(duplex),
            };
        }
    }
    Resolved {
        readable: descriptor.readable.as_ref().and_then(read_capability),
        writable: descriptor.writable.as_ref().and_then(write_capability),
    }
}

/// Names the kind of stream `input` is.
#[must_use]
pub fn classify(input: &StreamLike) -> StreamKind {
    match input {
        StreamLike::Push(stream) => match stream.kind() {
            PushKind::Readable => StreamKind::PushReadable,
            PushKind::Writable => StreamKind::PushWritable,
            PushKind::Duplex | PushKind::Transform => StreamKind::PushDuplex,
        },
        StreamLike::PullReadable(_) => StreamKind::PullReadable,
        StreamLike::PullWritable(_) => StreamKind::PullWritable,
        StreamLike::PullDuplex(_) => StreamKind::PullDuplex,
        StreamLike::Descriptor(descriptor) => {
            let found = descriptor_capabilities(descriptor);
            if found.readable.is_some() || found.writable.is_some() {
                StreamKind::Descriptor
            } else {
                StreamKind::Invalid
            }
        }
    }
}

/// Extracts read and write capabilities from `input`.
pub fn resolve(input: &StreamLike) -> Result<Resolved, BridgeError> {
    let resolved = match input {
        StreamLike::Push(stream) => Resolved {
            readable: stream
                .is_readable()
                .then(|| ReadSide::Push(stream.clone())),
            writable: stream
                .is_writable()
                .then(|| WriteSide::Push(stream.clone())),
        },
        StreamLike::PullReadable(stream) => Resolved {
            readable: Some(ReadSide::Pull(stream.clone())),
            writable: None,
        },
        StreamLike::PullWritable(stream) => Resolved {
            readable: None,
            writable: Some(WriteSide::Pull(stream.clone())),
        },
        StreamLike::PullDuplex(pair) => Resolved {
            readable: Some(ReadSide::Pull(pair.readable.clone())),
            writable: Some(WriteSide::Pull(pair.writable.clone())),
        },
        StreamLike::Descriptor(descriptor) => descriptor_capabilities(descriptor),
    };
    if resolved.readable.is_none() && resolved.writable.is_none() {
        return Err(BridgeError::InvalidStream(
            "no readable or writable capability found",
        ));
    }
    Ok(resolved)
}
