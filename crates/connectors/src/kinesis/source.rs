//! Kinesis source connector: pulls records from the origin stream.

use crate::kinesis::config::{InitialPosition, KinesisSourceConfig};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_sdk_kinesis::types::ShardIteratorType;
use bytes::Bytes;
use conveyor_core::record::payload_snippet;
use conveyor_core::Record;
use conveyor_runtime::{Emitter, Source};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One page of raw messages read from a stream partition.
pub struct ReadPage {
    pub payloads: Vec<Bytes>,
    /// Position to resume from; `None` when the partition is closed.
    pub next_cursor: Option<String>,
}

/// Read access to a partitioned stream through resumable cursors.
#[async_trait]
pub trait StreamFetcher: Send + 'static {
    /// Partitions of the stream, in a stable order.
    async fn partitions(&mut self) -> Result<Vec<String>>;

    /// Open a cursor on one partition at the given starting position.
    async fn open_cursor(&mut self, partition: &str, position: InitialPosition) -> Result<String>;

    /// Read the next page at `cursor`.
    async fn read(&mut self, cursor: &str, limit: i32) -> Result<ReadPage>;
}

/// A Kinesis source that consumes messages and emits decoded records.
///
/// At-least-once: a partition's cursor advances only after every decoded
/// record of the page has been handed downstream. Messages that fail to
/// decode are logged with a payload snippet and skipped; the cursor still
/// advances past them.
pub struct KinesisSource<F: StreamFetcher> {
    config: KinesisSourceConfig,
    fetcher: F,
}

impl<F: StreamFetcher> KinesisSource<F> {
    pub fn new(config: KinesisSourceConfig, fetcher: F) -> Self {
        Self { config, fetcher }
    }
}

impl KinesisSource<KinesisFetcher> {
    /// Connect to Kinesis with the AWS default credential chain.
    pub async fn connect(config: KinesisSourceConfig) -> Result<Self> {
        let fetcher = KinesisFetcher::connect(&config).await?;
        Ok(Self::new(config, fetcher))
    }
}

#[async_trait]
impl<F: StreamFetcher> Source for KinesisSource<F> {
    type Out = Record;

    async fn run(&mut self, out: &mut Emitter<Record>, stop: CancellationToken) -> Result<()> {
        let position = self.config.initial_position;
        let mut cursors = Vec::new();
        for partition in self.fetcher.partitions().await? {
            let cursor = self.fetcher.open_cursor(&partition, position).await?;
            cursors.push((partition, cursor));
        }

        info!(
            stream = %self.config.stream_name,
            partitions = cursors.len(),
            "source reading"
        );

        while !cursors.is_empty() && !stop.is_cancelled() {
            let mut produced = false;
            let mut next_round = Vec::with_capacity(cursors.len());

            let mut pending = cursors.into_iter();
            for (partition, cursor) in pending.by_ref() {
                if stop.is_cancelled() {
                    next_round.push((partition, cursor));
                    break;
                }

                let page = match self.fetcher.read(&cursor, self.config.fetch_limit).await {
                    Ok(page) => page,
                    Err(e) => {
                        warn!(partition = %partition, error = %e, "read failed, will retry");
                        next_round.push((partition, cursor));
                        continue;
                    }
                };

                produced = produced || !page.payloads.is_empty();
                for payload in &page.payloads {
                    match Record::decode(payload) {
                        Ok(record) => out.data(record).await?,
                        Err(e) => {
                            warn!(
                                partition = %partition,
                                error = %e,
                                payload = %payload_snippet(payload),
                                "skipping undecodable message"
                            );
                        }
                    }
                }

                // The page is fully handed downstream; only now advance.
                match page.next_cursor {
                    Some(next) => next_round.push((partition, next)),
                    None => info!(partition = %partition, "partition closed"),
                }
            }
            next_round.extend(pending);
            cursors = next_round;

            if !produced && !cursors.is_empty() {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval()) => {}
                }
            }
        }

        Ok(())
    }
}

/// [`StreamFetcher`] backed by the AWS Kinesis client.
pub struct KinesisFetcher {
    client: aws_sdk_kinesis::Client,
    stream_name: String,
}

impl KinesisFetcher {
    pub async fn connect(config: &KinesisSourceConfig) -> Result<Self> {
        let client = crate::kinesis::client_for(&config.region, config.endpoint_url.as_deref()).await;
        Ok(Self {
            client,
            stream_name: config.stream_name.clone(),
        })
    }
}

#[async_trait]
impl StreamFetcher for KinesisFetcher {
    async fn partitions(&mut self) -> Result<Vec<String>> {
        let resp = self
            .client
            .list_shards()
            .stream_name(&self.stream_name)
            .send()
            .await?;
        Ok(resp
            .shards()
            .iter()
            .map(|shard| shard.shard_id().to_string())
            .collect())
    }

    async fn open_cursor(&mut self, partition: &str, position: InitialPosition) -> Result<String> {
        let iterator_type = match position {
            InitialPosition::TrimHorizon => ShardIteratorType::TrimHorizon,
            InitialPosition::Latest => ShardIteratorType::Latest,
        };
        let resp = self
            .client
            .get_shard_iterator()
            .stream_name(&self.stream_name)
            .shard_id(partition)
            .shard_iterator_type(iterator_type)
            .send()
            .await?;
        resp.shard_iterator()
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("no shard iterator returned for {partition}"))
    }

    async fn read(&mut self, cursor: &str, limit: i32) -> Result<ReadPage> {
        let resp = self
            .client
            .get_records()
            .shard_iterator(cursor)
            .limit(limit)
            .send()
            .await?;
        let payloads = resp
            .records()
            .iter()
            .map(|record| Bytes::copy_from_slice(record.data().as_ref()))
            .collect();
        Ok(ReadPage {
            payloads,
            next_cursor: resp.next_shard_iterator().map(str::to_owned),
        })
    }
}
