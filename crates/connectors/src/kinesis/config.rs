//! Kinesis configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Where to start reading a stream when no prior position exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitialPosition {
    /// Oldest retained record.
    TrimHorizon,
    /// Only records produced after the cursor is opened.
    Latest,
}

/// Configuration for the Kinesis source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KinesisSourceConfig {
    /// Stream to consume from.
    pub stream_name: String,

    /// AWS region of the stream.
    pub region: String,

    /// Endpoint override (local stacks).
    pub endpoint_url: Option<String>,

    /// Starting position when opening shard cursors.
    pub initial_position: InitialPosition,

    /// Sleep between polls when the stream has no new data.
    pub poll_interval_ms: u64,

    /// Maximum records fetched per read call.
    pub fetch_limit: i32,
}

impl Default for KinesisSourceConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            initial_position: InitialPosition::TrimHorizon,
            poll_interval_ms: 1000,
            fetch_limit: 10_000,
        }
    }
}

impl KinesisSourceConfig {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            ..Default::default()
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_initial_position(mut self, position: InitialPosition) -> Self {
        self.initial_position = position;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Configuration for the Kinesis sink.
///
/// The batch thresholds default to the destination-imposed limits of a
/// Kinesis `PutRecords` call: 500 records, 5 MiB per call, 1 MiB per
/// record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KinesisSinkConfig {
    /// Stream to deliver to.
    pub stream_name: String,

    /// AWS region of the stream.
    pub region: String,

    /// Endpoint override (local stacks).
    pub endpoint_url: Option<String>,

    /// Maximum records per batch.
    pub max_batch_records: usize,

    /// Maximum cumulative payload bytes per batch.
    pub max_batch_bytes: usize,

    /// Maximum payload bytes for a single record.
    pub max_record_bytes: usize,

    /// Maximum time a batch may age before a forced flush, measured from
    /// its first admitted record.
    pub max_buffer_time_ms: u64,

    /// Maximum concurrently dispatched batches.
    pub max_in_flight_batches: usize,

    /// Maximum records admitted but not yet resolved (buffered plus
    /// in-flight); admission blocks at this bound.
    pub max_buffered_records: usize,

    /// Whether exhausting the retry budget for any record is fatal.
    pub fail_on_error: bool,

    /// Retries per batch after the initial delivery attempt.
    pub max_retries: u32,

    /// Base delay of the exponential backoff between retries.
    pub backoff_base_ms: u64,

    /// Upper bound on the backoff delay.
    pub backoff_cap_ms: u64,

    /// Maximum time an admission may stay blocked before the run is
    /// declared wedged. `None` blocks indefinitely.
    pub admission_timeout_ms: Option<u64>,
}

impl Default for KinesisSinkConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
            max_batch_records: 500,
            max_batch_bytes: 5 * 1024 * 1024,
            max_record_bytes: 1024 * 1024,
            max_buffer_time_ms: 5000,
            max_in_flight_batches: 50,
            max_buffered_records: 10_000,
            fail_on_error: true,
            max_retries: 10,
            backoff_base_ms: 100,
            backoff_cap_ms: 10_000,
            admission_timeout_ms: None,
        }
    }
}

impl KinesisSinkConfig {
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            ..Default::default()
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_fail_on_error(mut self, fail_on_error: bool) -> Self {
        self.fail_on_error = fail_on_error;
        self
    }

    pub fn max_buffer_time(&self) -> Duration {
        Duration::from_millis(self.max_buffer_time_ms)
    }

    pub fn admission_timeout(&self) -> Option<Duration> {
        self.admission_timeout_ms.map(Duration::from_millis)
    }
}
