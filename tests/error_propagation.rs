//! Errors cross the bridge as the same object, once.

mod common;

use std::sync::Arc;

use common::*;
use flowbridge::pull::{ReadableStream, WritableStream};
use flowbridge::push::{FnBehavior, PushKind, PushStream, done, fail};
use flowbridge::runtime;
use flowbridge::{
    PushOptions, ReadableMode, StreamDescriptor, StreamError, ToPullOptions, ToPushOptions,
    to_pull, to_push,
};

#[test]
fn push_source_error_survives_two_hops() {
    init_test("push_source_error_survives_two_hops");
    let source = PushStream::new(PushKind::Readable, FnBehavior::new(), PushOptions::default());
    let endpoint = to_pull(source.clone(), ToPullOptions::default()).expect("adapts");
    let adapted = to_push(endpoint, ToPushOptions::default()).expect("adapts back");
    let errors = collect_errors(&adapted);
    let _data = collect_data(&adapted);
    runtime::run_until_stalled();

    let cause = StreamError::msg("sensor offline");
    source.destroy(Some(cause.clone()));
    let closed_with = settle(adapted.closed());

    let errors = errors.lock().clone();
    flowbridge::assert_with_log!(errors.len() == 1, "error events", 1, errors.len());
    assert!(StreamError::same(&errors[0], &cause), "same error object");
    let closed_with = closed_with.expect("closed with error");
    assert!(StreamError::same(&closed_with, &cause));
    flowbridge::test_complete!("push_source_error_survives_two_hops");
}

#[test]
fn pull_source_error_is_emitted_once() {
    init_test("pull_source_error_is_emitted_once");
    let (source, controller) = ManualSource::new();
    let adapted = to_push(
        ReadableStream::new(source, ReadableMode::Default),
        ToPushOptions::default(),
    )
    .expect("adapts");
    let errors = collect_errors(&adapted);
    let _data = collect_data(&adapted);
    runtime::run_until_stalled();

    let cause = StreamError::msg("checksum mismatch");
    controller
        .lock()
        .as_ref()
        .expect("started")
        .error(cause.clone());
    runtime::run_until_stalled();

    let errors = errors.lock().clone();
    flowbridge::assert_with_log!(errors.len() == 1, "error events", 1, errors.len());
    assert!(StreamError::same(&errors[0], &cause));
    assert!(adapted.is_closed());
    flowbridge::test_complete!("pull_source_error_is_emitted_once");
}

#[test]
fn pull_sink_error_destroys_push_writer() {
    init_test("pull_sink_error_destroys_push_writer");
    let cause = StreamError::msg("quota exceeded");
    let adapted = to_push(
        WritableStream::new(FailingSink(cause.clone()), 1),
        ToPushOptions::default(),
    )
    .expect("adapts");
    let errors = collect_errors(&adapted);
    adapted.write("payload").expect("queued");
    let closed_with = settle(adapted.closed()).expect("closed with error");
    assert!(StreamError::same(&closed_with, &cause));

    let errors = errors.lock().clone();
    flowbridge::assert_with_log!(errors.len() == 1, "error events", 1, errors.len());
    assert!(StreamError::same(&errors[0], &cause));
    assert!(adapted.write("late").is_err(), "writes fail after destroy");
    flowbridge::test_complete!("pull_sink_error_destroys_push_writer");
}

#[test]
fn push_write_error_reaches_pull_writer_and_peer_readable() {
    init_test("push_write_error_reaches_pull_writer_and_peer_readable");
    let cause = StreamError::msg("connection reset");
    let failing = cause.clone();
    let target = PushStream::new(
        PushKind::Writable,
        FnBehavior::new().on_write(move |_, _| fail(failing.clone())),
        PushOptions::default().high_water_mark(1),
    );
    let peer = PushStream::new(
        PushKind::Readable,
        FnBehavior::new().on_read(|_| done()),
        PushOptions::default(),
    );
    let raised = collect_errors(&peer);
    let pair = to_pull(
        StreamDescriptor::new()
            .readable(peer.clone())
            .writable(target.clone()),
        ToPullOptions::default(),
    )
    .expect("adapts")
    .into_pair()
    .expect("pair");

    let writer = pair.writable.get_writer().expect("writer");
    let err = settle(writer.write("x")).expect_err("write rejected");
    assert!(StreamError::same(&err, &cause), "writer sees the sink error");
    runtime::run_until_stalled();

    assert!(target.is_destroyed());
    let raised = raised.lock().clone();
    assert!(
        raised.iter().any(|e| StreamError::same(e, &cause)),
        "peer readable re-raises the same error"
    );

    flowbridge::test_phase!("reader sees it too");
    let reader = pair.readable.get_reader().expect("reader");
    let read_err = settle(reader.read()).expect_err("readable errored");
    assert!(StreamError::same(&read_err, &cause));
    flowbridge::test_complete!("push_write_error_reaches_pull_writer_and_peer_readable");
}

#[test]
fn write_callback_error_destroys_adapter() {
    init_test("write_callback_error_destroys_adapter");
    let cause = StreamError::msg("callback refused");
    let rejected = cause.clone();
    let adapted = to_push(
        ReadableStream::empty(),
        ToPushOptions::default()
            .write_callback(Arc::new(move |_bytes: Vec<u8>| fail(rejected.clone()))),
    )
    .expect("adapts");
    adapted.write("data").expect("queued");
    let closed_with = settle(adapted.closed()).expect("closed with error");
    assert!(StreamError::same(&closed_with, &cause));
    flowbridge::test_complete!("write_callback_error_destroys_adapter");
}
