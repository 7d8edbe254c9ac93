//! Flowbridge: a lossless, backpressure-correct bridge between push streams and
//! pull streams.
//!
//! # Overview
//!
//! Two stream models meet here. A **push stream** is event-driven: producers
//! push chunks, consumers pause and resume, and a write reports backpressure by
//! returning `false`. A **pull stream** is consumer-driven: the stream asks its
//! source for data, queues it against a high water mark, and writers wait on a
//! readiness signal.
//!
//! - [`to_pull`] presents a push stream as a pull readable, writable, or pair.
//! - [`to_push`] presents a pull stream (or a pair) as a push stream.
//!
//! The two adapters are inverse: adapting one way and back reproduces the same
//! bytes and the same termination, modulo one extra buffering hop.
//!
//! # Guarantees
//!
//! - **Ordered**: reads and writes are strictly sequential per adapter
//! - **Backpressure both ways**: nothing is requested or accepted ahead of demand
//! - **Error identity**: errors cross the bridge as the same object, never re-wrapped
//! - **Exact lock ownership**: reader and writer locks are released once, in order
//!
//! # Module Structure
//!
//! - [`push`]: the push-stream model (`PushStream`, hooks, events)
//! - [`pull`]: the pull-stream model (`ReadableStream`, `WritableStream`, locks)
//! - [`classify`]: what an input is, and which capabilities it offers
//! - [`drain`]: suspending until a push stream's writes drain
//! - [`to_pull`](mod@to_pull) / [`to_push`](mod@to_push): the adapters
//! - [`lifecycle`]: lock leases and the ordered release sequence
//! - [`runtime`]: the single-threaded cooperative scheduler everything runs on
//! - [`sync`]: settle-once completions
//! - [`config`]: defaults and adapter options
//! - [`error`](mod@error): `StreamError` and `BridgeError`
//! - [`tracing_compat`]: optional tracing integration (requires `tracing-integration` feature)
//!
//! # Example
//!
//! ```
//! use flowbridge::push::PushStream;
//! use flowbridge::runtime::try_block_on;
//! use flowbridge::{ToPullOptions, to_pull};
//!
//! let source = PushStream::from_chunks(["hello"]);
//! let readable = to_pull(source, ToPullOptions::default())
//!     .unwrap()
//!     .into_readable()
//!     .unwrap();
//! let reader = readable.get_reader().unwrap();
//! let chunk = try_block_on(reader.read()).unwrap().unwrap();
//! assert_eq!(chunk.as_deref(), Some(&b"hello"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::future_not_send)]

pub mod chunk;
pub mod classify;
pub mod config;
pub mod drain;
pub mod error;
pub mod lifecycle;
pub mod pull;
pub mod push;
pub mod runtime;
pub mod sync;
pub mod to_pull;
pub mod to_push;
pub mod tracing_compat;

// ── Test-only modules ───────────────────────────────────────────────────
#[cfg(any(test, feature = "test-internals"))]
pub mod test_utils;

pub use chunk::Chunk;
pub use classify::{StreamDescriptor, StreamKind, StreamLike, classify};
pub use config::{BridgeConfig, PushOptions, ReadableMode, ToPullOptions, ToPushOptions};
pub use drain::drained;
pub use error::{BridgeError, StreamError};
pub use to_pull::{PairKind, PullEndpoint, PullPair, to_pull};
pub use to_push::{PullBackedStream, to_push};
