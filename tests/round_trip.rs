//! Adapting one way and back reproduces the payload and its termination.

mod common;

use common::*;
use flowbridge::push::PushStream;
use flowbridge::pull::{CollectSink, ReadableStream, WritableStream};
use flowbridge::{ReadableMode, ToPullOptions, ToPushOptions, to_pull, to_push};
use proptest::prelude::*;

fn payloads() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 0..24)
}

fn modes() -> impl Strategy<Value = ReadableMode> {
    prop_oneof![Just(ReadableMode::Default), Just(ReadableMode::Bytes)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn push_round_trip_preserves_bytes(chunks in payloads(), mode in modes()) {
        init_test_logging();
        let expected: Vec<u8> = chunks.concat();
        let endpoint = to_pull(
            PushStream::from_chunks(chunks),
            ToPullOptions::default().mode(mode),
        )
        .expect("adapts");
        let adapted = to_push(endpoint, ToPushOptions::default()).expect("adapts back");
        let data = collect_data(&adapted);
        settle(adapted.ended()).expect("ended");
        prop_assert_eq!(&*data.lock(), &expected);
        prop_assert_eq!(adapted.bytes_read(), expected.len() as u64);
    }

    #[test]
    fn pull_round_trip_preserves_chunks(chunks in payloads()) {
        init_test_logging();
        let adapted = to_push(
            ReadableStream::from_chunks(chunks.clone()),
            ToPushOptions::default(),
        )
        .expect("adapts");
        let readable = to_pull(adapted.into_stream(), ToPullOptions::default())
            .expect("adapts back")
            .into_readable()
            .expect("readable");
        let reader = readable.get_reader().expect("reader");
        let mut seen = Vec::new();
        while let Some(chunk) = settle(reader.read()).expect("read ok") {
            seen.push(chunk);
        }
        prop_assert_eq!(seen.concat(), chunks.concat());
    }

    #[test]
    fn push_writable_round_trip_leaves_inner_open(chunks in payloads()) {
        init_test_logging();
        let (inner, written) = slow_writable(16, 0);
        let writable = to_pull(inner.clone(), ToPullOptions::default())
            .expect("adapts")
            .into_writable()
            .expect("writable");
        let outer = to_push(writable, ToPushOptions::default()).expect("adapts back");
        for chunk in &chunks {
            outer.write(chunk.clone()).expect("write");
        }
        outer.end();
        settle(outer.finished()).expect("finished");
        prop_assert_eq!(&*written.lock(), &chunks.concat());
        // Ending the outer stream leaves the inner one to its owner.
        prop_assert!(!inner.is_finished());
    }

    #[test]
    fn pull_writable_round_trip_leaves_sink_open(chunks in payloads()) {
        init_test_logging();
        let sink = CollectSink::new();
        let adapted = to_push(WritableStream::new(sink.clone(), 1), ToPushOptions::default())
            .expect("adapts");
        let writable = to_pull(adapted.into_stream(), ToPullOptions::default())
            .expect("adapts back")
            .into_writable()
            .expect("writable");
        let writer = writable.get_writer().expect("writer");
        for chunk in &chunks {
            settle(writer.write(chunk.clone())).expect("write ok");
        }
        settle(writer.close()).expect("close ok");
        prop_assert_eq!(sink.bytes(), chunks.concat());
        prop_assert!(!sink.is_closed());
    }
}
