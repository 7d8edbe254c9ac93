//! Handing pull locks back from a push adapter.

mod common;

use common::*;
use flowbridge::pull::{CollectSink, ReadableStream, WritableStream};
use flowbridge::runtime;
use flowbridge::{ReadableMode, StreamDescriptor, ToPushOptions, to_push};

#[test]
fn close_waits_for_in_flight_read() {
    init_test("close_waits_for_in_flight_read");
    let (source, controller) = ManualSource::new();
    let readable = ReadableStream::new(source, ReadableMode::Default);
    let adapted = to_push(readable.clone(), ToPushOptions::default()).expect("adapts");
    let data = collect_data(&adapted);
    runtime::run_until_stalled();

    flowbridge::test_phase!("release with a read outstanding");
    let closing = adapted.clone();
    let close = runtime::spawn(async move { closing.close().await });
    runtime::run_until_stalled();
    assert!(adapted.is_released());
    assert!(readable.is_locked(), "reader held until the read settles");

    flowbridge::test_phase!("settle the read");
    controller
        .lock()
        .as_ref()
        .expect("started")
        .enqueue("late")
        .expect("enqueued");
    settle(close).expect("released");
    assert!(!readable.is_locked());
    assert!(readable.state().is_open(), "pull readable left open");

    settle(adapted.ended()).expect("ended");
    assert!(data.lock().is_empty(), "nothing forwarded after release");
    flowbridge::assert_with_log!(
        adapted.bytes_read() == 0,
        "bytes read",
        0,
        adapted.bytes_read()
    );
    flowbridge::test_complete!("close_waits_for_in_flight_read");
}

#[test]
fn close_flushes_writes_before_releasing_writer() {
    init_test("close_flushes_writes_before_releasing_writer");
    let sink = CollectSink::new();
    let writable = WritableStream::new(sink.clone(), 1);
    let readable = ReadableStream::from_chunks(["unused"]);
    let adapted = to_push(
        StreamDescriptor::new()
            .readable(readable.clone())
            .writable(writable.clone()),
        ToPushOptions::default(),
    )
    .expect("adapts");
    adapted.write("first").expect("write");
    adapted.end_with("second").expect("end");
    runtime::run_until_stalled();

    settle(adapted.close()).expect("released");
    assert_eq!(sink.bytes(), b"firstsecond");
    assert!(!writable.is_locked());
    assert!(!readable.is_locked());
    assert!(!sink.is_closed(), "writable left open");

    flowbridge::test_phase!("locks are reusable");
    let writer = writable.get_writer().expect("writer after release");
    settle(writer.write("third")).expect("write ok");
    let reader = readable.get_reader().expect("reader after release");
    let chunk = settle(reader.read()).expect("read ok");
    assert_eq!(chunk.as_deref(), Some(&b"unused"[..]));
    assert_eq!(sink.bytes(), b"firstsecondthird");
    flowbridge::test_complete!("close_flushes_writes_before_releasing_writer");
}
