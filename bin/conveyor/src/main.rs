//! Session relay job: Kinesis -> enrich -> re-key -> Kinesis.
//!
//! Flow:
//!   kinesis source -> decode -> add processing timestamp ->
//!   key by session_id -> encode -> batching kinesis sink
//!
//! Records sharing a `session_id` reach the sink buffer in read order;
//! destination routing keys are random, spreading load across shards.
//!
//! # Usage
//!
//! ```bash
//! conveyor --config application_properties.json
//! ```
//!
//! Ctrl-C drains the pipeline (partial batches flush, in-flight batches
//! resolve) before exiting. Exit status is 0 when the run stopped cleanly
//! and non-zero when it failed.
//!
//! # Configuration
//!
//! ```json
//! {
//!   "source": { "stream_name": "events-source", "region": "ap-southeast-1" },
//!   "sink": {
//!     "stream_name": "events-sink",
//!     "region": "ap-southeast-1",
//!     "max_batch_records": 500,
//!     "max_buffer_time_ms": 5000,
//!     "fail_on_error": true
//!   }
//! }
//! ```

mod config;

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use config::{AppConfig, SchemaErrorPolicy};
use conveyor_connectors::kinesis::{KinesisSink, KinesisSource};
use conveyor_core::Record;
use conveyor_operators::{
    session_key, KeyByOperator, KeyedRecord, MapOperator, ProcessingTimeEnricher,
};
use conveyor_runtime::Pipeline;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conveyor", about = "Session-keyed stream relay")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "application_properties.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;

    info!(
        source = %config.source.stream_name,
        sink = %config.sink.stream_name,
        "starting session relay"
    );

    let source = KinesisSource::connect(config.source.clone()).await?;
    let sink = KinesisSink::connect(config.sink.clone()).await?;

    let enricher = match config.schema_errors {
        SchemaErrorPolicy::Drop => ProcessingTimeEnricher::new(),
        SchemaErrorPolicy::DeadLetter => {
            let (tx, mut rx) =
                mpsc::channel::<(Record, conveyor_core::SchemaError)>(config.channel_capacity);
            tokio::spawn(async move {
                while let Some((record, err)) = rx.recv().await {
                    error!(error = %err, record = %record.snippet(), "dead-lettered record");
                }
            });
            ProcessingTimeEnricher::new().with_dead_letter(tx)
        }
    };

    let pipeline = Pipeline::builder(config.channel_capacity)
        .source("kinesis_source", source)
        .operator("enrich", enricher)
        .operator("key_by", KeyByOperator::new(session_key))
        .operator(
            "encode",
            MapOperator::new(|keyed: KeyedRecord<String, Record>| {
                Bytes::from(keyed.value.encode())
            }),
        )
        .sink("kinesis_sink", sink);

    let stop = pipeline.stop_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("stop requested");
            stop.cancel();
        }
    });

    pipeline.run().await
}
