//! Shared helpers for the integration suites.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use flowbridge::PushOptions;
use flowbridge::StreamError;
use flowbridge::pull::{PullFuture, ReadableController, UnderlyingSink, UnderlyingSource, resolved};
use flowbridge::push::{Event, EventKind, FnBehavior, PushKind, PushStream};
use flowbridge::runtime::{self, try_block_on};
use parking_lot::Mutex;

pub use flowbridge::test_utils::init_test_logging;

pub fn init_test(name: &str) {
    init_test_logging();
    flowbridge::test_phase!(name);
}

/// Drives `future` to completion, failing the test if the scheduler stalls.
pub fn settle<F: Future>(future: F) -> F::Output {
    try_block_on(future).expect("future stalled")
}

/// Concatenates every `Data` payload `stream` emits. Attaching resumes the stream.
pub fn collect_data(stream: &PushStream) -> Arc<Mutex<Vec<u8>>> {
    let out = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&out);
    stream.on_data(move |chunk| sink.lock().extend_from_slice(chunk.as_bytes()));
    out
}

pub fn collect_errors(stream: &PushStream) -> Arc<Mutex<Vec<StreamError>>> {
    let out = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&out);
    stream.on_error(move |err| sink.lock().push(err.clone()));
    out
}

pub fn count_events(stream: &PushStream, kind: EventKind) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    stream.on(kind, move |_: &Event<'_>| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    count
}

/// A push writable whose write hook yields `yields` times before accepting a chunk.
pub fn slow_writable(hwm: usize, yields: usize) -> (PushStream, Arc<Mutex<Vec<u8>>>) {
    let written = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&written);
    let behavior = FnBehavior::new().on_write(move |_, chunk| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            for _ in 0..yields {
                runtime::yield_now().await;
            }
            sink.lock().extend_from_slice(chunk.as_bytes());
            Ok(())
        })
    });
    let stream = PushStream::new(
        PushKind::Writable,
        behavior,
        PushOptions::default().high_water_mark(hwm),
    );
    (stream, written)
}

/// Enqueues `total` numbered chunks, one per pull, then closes.
pub struct CountingSource {
    total: usize,
    pulls: Arc<AtomicUsize>,
}

impl CountingSource {
    pub fn new(total: usize) -> (Self, Arc<AtomicUsize>) {
        let pulls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                total,
                pulls: Arc::clone(&pulls),
            },
            pulls,
        )
    }

    pub fn chunk(n: usize) -> String {
        format!("{n:04}")
    }

    pub fn expected(total: usize) -> Vec<u8> {
        (0..total).flat_map(|n| Self::chunk(n).into_bytes()).collect()
    }
}

impl UnderlyingSource for CountingSource {
    fn pull(&self, controller: &ReadableController) -> PullFuture {
        let n = self.pulls.fetch_add(1, Ordering::SeqCst);
        let outcome = if n < self.total {
            controller.enqueue(Self::chunk(n))
        } else {
            controller.close()
        };
        Box::pin(async move { outcome })
    }
}

/// Rejects every write with the same error.
pub struct FailingSink(pub StreamError);

impl UnderlyingSink for FailingSink {
    fn write(&self, _chunk: Vec<u8>) -> PullFuture {
        let err = self.0.clone();
        Box::pin(async move { Err(err) })
    }
}

/// Captures the controller so a test can drive the stream by hand.
pub struct ManualSource(pub Arc<Mutex<Option<ReadableController>>>);

impl ManualSource {
    pub fn new() -> (Self, Arc<Mutex<Option<ReadableController>>>) {
        let slot = Arc::new(Mutex::new(None));
        (Self(Arc::clone(&slot)), slot)
    }
}

impl UnderlyingSource for ManualSource {
    fn start(&self, controller: &ReadableController) -> PullFuture {
        *self.0.lock() = Some(controller.clone());
        resolved()
    }
}
