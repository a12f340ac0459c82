//! End-to-end relay scenarios over the in-memory stream doubles.

use bytes::Bytes;
use conveyor_connectors::kinesis::{
    InMemoryStream, InMemoryTransport, KinesisSink, KinesisSinkConfig, KinesisSource,
    KinesisSourceConfig, SinkCounters,
};
use conveyor_core::{Record, PROCESSING_TIME_FIELD};
use conveyor_operators::{
    session_key, KeyByOperator, KeyedRecord, MapOperator, ProcessingTimeEnricher,
};
use conveyor_runtime::{Pipeline, PipelineState};
use std::sync::atomic::Ordering;
use std::sync::Arc;

fn relay(
    stream: InMemoryStream,
    transport: InMemoryTransport,
    sink_config: KinesisSinkConfig,
) -> (Pipeline, Arc<SinkCounters>) {
    let source = KinesisSource::new(KinesisSourceConfig::new("events-source"), stream);
    let sink = KinesisSink::new(sink_config, transport);
    let counters = sink.counters();
    let pipeline = Pipeline::builder(32)
        .source("kinesis_source", source)
        .operator("enrich", ProcessingTimeEnricher::new())
        .operator("key_by", KeyByOperator::new(session_key))
        .operator(
            "encode",
            MapOperator::new(|keyed: KeyedRecord<String, Record>| {
                Bytes::from(keyed.value.encode())
            }),
        )
        .sink("kinesis_sink", sink);
    (pipeline, counters)
}

fn sink_config() -> KinesisSinkConfig {
    KinesisSinkConfig {
        backoff_base_ms: 1,
        backoff_cap_ms: 2,
        ..KinesisSinkConfig::new("events-sink")
    }
}

fn decode_all(payloads: Vec<Bytes>) -> Vec<Record> {
    payloads
        .iter()
        .map(|p| Record::decode(p).unwrap())
        .collect()
}

#[tokio::test]
async fn relays_and_enriches_with_session_order_preserved() {
    let stream = InMemoryStream::new();
    stream.push(r#"{"session_id":"s1","v":1}"#);
    stream.push(r#"{"session_id":"s1","v":2}"#);
    stream.push(r#"{"session_id":"s2","v":1}"#);
    stream.close();

    let transport = InMemoryTransport::new();
    let config = KinesisSinkConfig {
        max_batch_records: 2,
        max_in_flight_batches: 1,
        ..sink_config()
    };
    let (pipeline, counters) = relay(stream, transport.clone(), config);
    let state = pipeline.state();

    pipeline.run().await.unwrap();
    assert_eq!(*state.borrow(), PipelineState::Stopped);

    // The first flushed batch holds the two s1 records, in read order.
    let batches = transport.batches();
    let first = decode_all(batches[0].clone());
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|r| r.session_id().unwrap() == "s1"));
    assert_eq!(first[0].get("v").unwrap().as_i64().unwrap(), 1);
    assert_eq!(first[1].get("v").unwrap().as_i64().unwrap(), 2);

    // Each record delivered exactly once, each carrying the stamp.
    let delivered = decode_all(transport.deliveries());
    assert_eq!(delivered.len(), 3);
    for record in &delivered {
        assert!(record.get(PROCESSING_TIME_FIELD).is_some());
    }
    assert_eq!(counters.delivered.load(Ordering::Relaxed), 3);
}

#[tokio::test]
async fn per_session_order_survives_interleaving() {
    let stream = InMemoryStream::new();
    for i in 0..10 {
        stream.push(format!(r#"{{"session_id":"s1","v":{i}}}"#));
        stream.push(format!(r#"{{"session_id":"s2","v":{i}}}"#));
    }
    stream.close();

    let transport = InMemoryTransport::new();
    let config = KinesisSinkConfig {
        max_batch_records: 3,
        // Sequential dispatch keeps delivery order equal to admission order.
        max_in_flight_batches: 1,
        ..sink_config()
    };
    let (pipeline, _) = relay(stream, transport.clone(), config);
    pipeline.run().await.unwrap();

    let delivered = decode_all(transport.deliveries());
    assert_eq!(delivered.len(), 20);
    for session in ["s1", "s2"] {
        let values: Vec<i64> = delivered
            .iter()
            .filter(|r| r.session_id().unwrap() == session)
            .map(|r| r.get("v").unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(values, (0..10).collect::<Vec<i64>>(), "{session} reordered");
    }
}

#[tokio::test]
async fn lenient_mode_drops_failed_record_and_continues() {
    let stream = InMemoryStream::new();
    stream.push(r#"{"session_id":"s1","v":1}"#);
    stream.push(r#"{"session_id":"s1","v":2}"#);
    stream.push(r#"{"session_id":"s2","v":3}"#);
    stream.push(r#"{"session_id":"s2","v":4}"#);
    stream.close();

    let transport = InMemoryTransport::new();
    // The record with v=2 is rejected on the initial put and on the retry.
    transport.reject_matching(r#""v":2"#, 2);
    let config = KinesisSinkConfig {
        max_batch_records: 3,
        max_in_flight_batches: 1,
        max_retries: 1,
        fail_on_error: false,
        ..sink_config()
    };
    let (pipeline, counters) = relay(stream, transport.clone(), config);
    let state = pipeline.state();

    pipeline.run().await.unwrap();
    assert_eq!(*state.borrow(), PipelineState::Stopped);

    let delivered = decode_all(transport.deliveries());
    let values: Vec<i64> = delivered
        .iter()
        .map(|r| r.get("v").unwrap().as_i64().unwrap())
        .collect();
    // v=2 is gone; the record admitted after the failure still arrives.
    assert_eq!(values, vec![1, 3, 4]);
    assert_eq!(counters.dropped.load(Ordering::Relaxed), 1);
    assert_eq!(counters.delivered.load(Ordering::Relaxed), 3);
}

#[tokio::test]
async fn strict_mode_fails_the_run_when_retries_exhaust() {
    let stream = InMemoryStream::new();
    stream.push(r#"{"session_id":"s1","v":1}"#);
    stream.push(r#"{"session_id":"s1","v":2}"#);
    stream.push(r#"{"session_id":"s2","v":3}"#);
    stream.close();

    let transport = InMemoryTransport::new();
    transport.reject_matching(r#""v":2"#, 2);
    let config = KinesisSinkConfig {
        max_batch_records: 3,
        max_retries: 1,
        fail_on_error: true,
        ..sink_config()
    };
    let (pipeline, _) = relay(stream, transport.clone(), config);
    let state = pipeline.state();

    assert!(pipeline.run().await.is_err());
    assert!(matches!(&*state.borrow(), PipelineState::Failed(_)));
}

#[tokio::test]
async fn malformed_and_schema_invalid_records_do_not_stall_the_relay() {
    let stream = InMemoryStream::new();
    stream.push(r#"{"session_id":"s1","v":1}"#);
    stream.push("not valid structured text");
    stream.push(r#"{"v":2}"#); // no session_id
    stream.push(r#"{"session_id":"s2","v":3}"#);
    stream.close();

    let transport = InMemoryTransport::new();
    let (pipeline, counters) = relay(stream, transport.clone(), sink_config());
    pipeline.run().await.unwrap();

    let delivered = decode_all(transport.deliveries());
    let sessions: Vec<&str> = delivered.iter().map(|r| r.session_id().unwrap()).collect();
    assert_eq!(sessions, vec!["s1", "s2"]);
    assert_eq!(counters.delivered.load(Ordering::Relaxed), 2);
}
