//! Backpressure crosses the bridge in both directions without losing data.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::*;
use flowbridge::pull::ReadableStream;
use flowbridge::push::{EventKind, PushStream};
use flowbridge::runtime;
use flowbridge::{PushOptions, ReadableMode, ToPullOptions, ToPushOptions, to_pull, to_push};

#[test]
fn slow_push_sink_suspends_pull_writer() {
    init_test("slow_push_sink_suspends_pull_writer");
    let (target, written) = slow_writable(4, 3);
    let drains = count_events(&target, EventKind::Drain);
    let writable = to_pull(target.clone(), ToPullOptions::default())
        .expect("adapts")
        .into_writable()
        .expect("writable");
    let writer = writable.get_writer().expect("writer");

    let chunks: Vec<String> = (0..32).map(|n| format!("chunk{n:03}")).collect();
    let expected = chunks.concat().into_bytes();

    flowbridge::test_phase!("write all");
    settle(async {
        for chunk in &chunks {
            writer.ready().await?;
            writer.write(chunk.as_str()).await?;
            // Each accepted write has drained through the push stream.
            assert_eq!(target.queue_len(), 0);
            assert!(!target.is_writing());
        }
        writer.close().await
    })
    .expect("writes ok");

    let drain_count = drains.load(Ordering::SeqCst);
    flowbridge::assert_with_log!(drain_count > 0, "drain suspensions", "> 0", drain_count);
    let written = written.lock().clone();
    flowbridge::assert_with_log!(
        written == expected,
        "bytes written",
        expected.len(),
        written.len()
    );
    assert!(target.is_finished());
    flowbridge::test_complete!("slow_push_sink_suspends_pull_writer");
}

#[test]
fn paused_push_consumer_stops_pulling() {
    init_test("paused_push_consumer_stops_pulling");
    const TOTAL: usize = 100;
    let (source, pulls) = CountingSource::new(TOTAL);
    let adapted = to_push(
        ReadableStream::new(source, ReadableMode::Default),
        ToPushOptions::default().push(PushOptions::default().high_water_mark(8)),
    )
    .expect("adapts");

    flowbridge::test_phase!("consume one chunk then pause");
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let stream = adapted.stream().clone();
    adapted.on_data(move |chunk| {
        sink.lock().extend_from_slice(chunk.as_bytes());
        stream.pause();
    });
    runtime::run_until_stalled();
    let pulled = pulls.load(Ordering::SeqCst);
    flowbridge::assert_with_log!(pulled < 8, "pulls while paused", "< 8", pulled);
    assert!(seen.lock().len() < TOTAL * 4);

    flowbridge::test_phase!("resume to completion");
    let resumed = adapted.stream().clone();
    let keep_flowing = adapted.stream().clone();
    resumed.on(EventKind::Data, move |_| keep_flowing.resume());
    resumed.resume();
    settle(adapted.ended()).expect("ended");
    let seen = seen.lock().clone();
    assert_eq!(seen, CountingSource::expected(TOTAL));
    flowbridge::test_complete!("paused_push_consumer_stops_pulling");
}

#[test]
fn byte_mode_reads_only_on_demand() {
    init_test("byte_mode_reads_only_on_demand");
    let reads = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&reads);
    let source = PushStream::new(
        flowbridge::push::PushKind::Readable,
        flowbridge::push::FnBehavior::new().on_read(move |stream| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                stream.push(Some(format!("r{n}").into()));
            } else {
                stream.push(None);
            }
            flowbridge::push::done()
        }),
        PushOptions::default(),
    );
    let readable = to_pull(source.clone(), ToPullOptions::default().bytes())
        .expect("adapts")
        .into_readable()
        .expect("readable");
    runtime::run_until_stalled();
    assert_eq!(reads.load(Ordering::SeqCst), 0, "nothing requested before a read");

    let reader = readable.get_reader().expect("reader");
    let mut seen = Vec::new();
    while let Some(chunk) = settle(reader.read()).expect("read ok") {
        seen.extend(chunk);
        runtime::run_until_stalled();
        assert!(source.is_paused() || source.is_ended(), "source pauses between reads");
    }
    assert_eq!(seen, b"r0r1r2");
    flowbridge::test_complete!("byte_mode_reads_only_on_demand");
}
