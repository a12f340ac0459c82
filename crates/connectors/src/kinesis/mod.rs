//! AWS Kinesis connector.
//!
//! This module provides the source and sink ends of the relay:
//!
//! - **Source**: consumes a stream shard-by-shard through a resumable
//!   cursor, skipping (and logging) undecodable messages
//! - **Sink**: buffers encoded records into bounded batches and delivers
//!   them with partial-failure retry, admission control, and backpressure
//!
//! Both ends are generic over a small transport trait so wiring tests can
//! run against the in-memory doubles in [`memory`].

mod config;
mod memory;
mod sink;
mod source;

pub use config::{InitialPosition, KinesisSinkConfig, KinesisSourceConfig};
pub use memory::{InMemoryStream, InMemoryTransport};
pub use sink::{
    DispatchOutcome, FailedPut, KinesisSink, KinesisTransport, PutBatchOutcome, PutEntry,
    SinkCounters, SinkTransport,
};
pub use source::{KinesisFetcher, KinesisSource, ReadPage, StreamFetcher};

/// Build a Kinesis client for the given region, honoring an endpoint
/// override (local stacks, integration environments).
pub(crate) async fn client_for(region: &str, endpoint_url: Option<&str>) -> aws_sdk_kinesis::Client {
    let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()))
        .load()
        .await;
    let mut builder = aws_sdk_kinesis::config::Builder::from(&shared);
    if let Some(url) = endpoint_url {
        builder = builder.endpoint_url(url);
    }
    aws_sdk_kinesis::Client::from_conf(builder.build())
}
