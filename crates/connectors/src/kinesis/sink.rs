//! Kinesis sink connector: batches encoded records and delivers them.
//!
//! The sink owns two bounded windows. Admission control holds one permit
//! per record from `handle` until the record's batch resolves, so buffered
//! plus in-flight records never exceed `max_buffered_records`; a second
//! semaphore bounds concurrently dispatched batches. Both block when
//! exhausted, which is how backpressure reaches the upstream stages.

use crate::kinesis::config::KinesisSinkConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_sdk_kinesis::primitives::Blob;
use aws_sdk_kinesis::types::PutRecordsRequestEntry;
use bytes::Bytes;
use conveyor_core::DispatchError;
use conveyor_runtime::Sink;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// How often completed dispatches are reaped while the buffer sits empty.
const REAP_INTERVAL: Duration = Duration::from_millis(100);

/// An encoded record ready for the destination: payload bytes plus the
/// routing key that picks the destination shard.
#[derive(Debug, Clone)]
pub struct PutEntry {
    pub routing_key: String,
    pub payload: Bytes,
}

impl PutEntry {
    /// Tag a payload with a uniformly random routing key.
    ///
    /// The upstream session key deliberately plays no part here: session
    /// order is preserved up to buffering, while destination shards get an
    /// even spread of load.
    pub fn random(payload: Bytes) -> Self {
        Self {
            routing_key: Uuid::new_v4().to_string(),
            payload,
        }
    }
}

/// A record the destination rejected within an otherwise accepted call.
#[derive(Debug, Clone)]
pub struct FailedPut {
    /// Index into the submitted batch.
    pub index: usize,
    pub code: String,
    pub message: String,
}

/// Per-record results of one batched put.
#[derive(Debug, Default)]
pub struct PutBatchOutcome {
    pub failed: Vec<FailedPut>,
}

/// Write access to the destination stream.
#[async_trait]
pub trait SinkTransport: Send + Sync + 'static {
    /// Deliver one batch as a single call. The destination may accept a
    /// subset; rejected records come back in the outcome. An `Err` is a
    /// connection-level fault and aborts the run.
    async fn put_batch(
        &self,
        stream: &str,
        entries: &[PutEntry],
    ) -> Result<PutBatchOutcome, DispatchError>;
}

/// Terminal result of one batch's delivery attempts.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Every record acknowledged.
    Delivered { records: usize },
    /// Retry budget spent in lenient mode; leftover failures dropped.
    Dropped { delivered: usize, dropped: usize },
}

/// Delivery counters, shared with the dispatch tasks.
#[derive(Debug, Default)]
pub struct SinkCounters {
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub retries: AtomicU64,
}

#[derive(Default)]
struct OpenBatch {
    entries: Vec<PutEntry>,
    bytes: usize,
    opened_at: Option<Instant>,
    permits: Vec<OwnedSemaphorePermit>,
}

/// A batching sink for a Kinesis-shaped destination.
///
/// A batch flushes on whichever bound is hit first: record count, byte
/// size, or age since its first record. Flushing hands the batch to a
/// concurrent dispatch task and immediately opens a fresh batch.
pub struct KinesisSink<T: SinkTransport> {
    config: KinesisSinkConfig,
    transport: Arc<T>,
    batch: OpenBatch,
    buffered: Arc<Semaphore>,
    in_flight: Arc<Semaphore>,
    dispatches: JoinSet<Result<DispatchOutcome, DispatchError>>,
    counters: Arc<SinkCounters>,
}

impl<T: SinkTransport> KinesisSink<T> {
    pub fn new(config: KinesisSinkConfig, transport: T) -> Self {
        let buffered = Arc::new(Semaphore::new(config.max_buffered_records));
        let in_flight = Arc::new(Semaphore::new(config.max_in_flight_batches));
        Self {
            config,
            transport: Arc::new(transport),
            batch: OpenBatch::default(),
            buffered,
            in_flight,
            dispatches: JoinSet::new(),
            counters: Arc::new(SinkCounters::default()),
        }
    }

    /// Delivery counters for this sink.
    pub fn counters(&self) -> Arc<SinkCounters> {
        Arc::clone(&self.counters)
    }

    /// Collect finished dispatch tasks; a fatal dispatch fails the sink.
    fn reap(&mut self) -> Result<()> {
        while let Some(joined) = self.dispatches.try_join_next() {
            note_outcome(joined)?;
        }
        Ok(())
    }

    async fn acquire_admission(&self) -> Result<OwnedSemaphorePermit> {
        match self.config.admission_timeout() {
            Some(limit) => {
                match tokio::time::timeout(limit, self.buffered.clone().acquire_owned()).await {
                    Ok(permit) => Ok(permit?),
                    Err(_) => Err(DispatchError::BackpressureTimeout { timeout: limit }.into()),
                }
            }
            None => Ok(self.buffered.clone().acquire_owned().await?),
        }
    }

    /// Hand the open batch to a dispatch task and reset the buffer.
    async fn flush(&mut self) -> Result<()> {
        if self.batch.entries.is_empty() {
            return Ok(());
        }
        let entries = std::mem::take(&mut self.batch.entries);
        let permits = std::mem::take(&mut self.batch.permits);
        self.batch.bytes = 0;
        self.batch.opened_at = None;

        debug!(records = entries.len(), "flushing batch");
        // Blocks when the in-flight window is full, which in turn blocks
        // admission upstream.
        let slot = self.in_flight.clone().acquire_owned().await?;
        self.dispatches.spawn(dispatch_batch(
            Arc::clone(&self.transport),
            self.config.clone(),
            Arc::clone(&self.counters),
            entries,
            permits,
            slot,
        ));
        Ok(())
    }
}

impl KinesisSink<KinesisTransport> {
    /// Connect to Kinesis with the AWS default credential chain.
    pub async fn connect(config: KinesisSinkConfig) -> Result<Self> {
        let transport = KinesisTransport::connect(&config).await?;
        Ok(Self::new(config, transport))
    }
}

#[async_trait]
impl<T: SinkTransport> Sink for KinesisSink<T> {
    type In = Bytes;

    async fn handle(&mut self, payload: Bytes) -> Result<()> {
        self.reap()?;

        if payload.len() > self.config.max_record_bytes {
            let err = DispatchError::OversizedRecord {
                size: payload.len(),
                limit: self.config.max_record_bytes,
            };
            if self.config.fail_on_error {
                return Err(err.into());
            }
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "dropping oversized record");
            return Ok(());
        }

        let permit = self.acquire_admission().await?;
        let entry = PutEntry::random(payload);

        if !self.batch.entries.is_empty()
            && self.batch.bytes + entry.payload.len() > self.config.max_batch_bytes
        {
            self.flush().await?;
        }
        if self.batch.entries.is_empty() {
            self.batch.opened_at = Some(Instant::now());
        }
        self.batch.bytes += entry.payload.len();
        self.batch.entries.push(entry);
        self.batch.permits.push(permit);

        if self.batch.entries.len() >= self.config.max_batch_records
            || self.batch.bytes >= self.config.max_batch_bytes
        {
            self.flush().await?;
        }
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        if let Some(opened) = self.batch.opened_at {
            Some(opened + self.config.max_buffer_time())
        } else if !self.dispatches.is_empty() {
            Some(Instant::now() + REAP_INTERVAL)
        } else {
            None
        }
    }

    async fn tick(&mut self) -> Result<()> {
        self.reap()?;
        if let Some(opened) = self.batch.opened_at {
            if opened.elapsed() >= self.config.max_buffer_time() {
                debug!("buffer time reached, flushing");
                self.flush().await?;
            }
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<()> {
        self.flush().await?;
        while let Some(joined) = self.dispatches.join_next().await {
            note_outcome(joined)?;
        }
        Ok(())
    }
}

fn note_outcome(joined: Result<Result<DispatchOutcome, DispatchError>, JoinError>) -> Result<()> {
    match joined {
        Ok(Ok(DispatchOutcome::Delivered { records })) => {
            debug!(records, "batch delivered");
            Ok(())
        }
        Ok(Ok(DispatchOutcome::Dropped { delivered, dropped })) => {
            warn!(delivered, dropped, "batch resolved with dropped records");
            Ok(())
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(anyhow!("dispatch task panicked: {e}")),
    }
}

/// Deliver one batch: `Pending -> Retrying(n) -> {Delivered, Dropped, Err}`.
///
/// Records the destination rejects are retried as a sub-batch holding only
/// the failed subset, with exponential backoff, until the retry budget is
/// spent. The admission permits travel with the batch and are released one
/// per resolved record.
async fn dispatch_batch<T: SinkTransport>(
    transport: Arc<T>,
    config: KinesisSinkConfig,
    counters: Arc<SinkCounters>,
    mut entries: Vec<PutEntry>,
    mut permits: Vec<OwnedSemaphorePermit>,
    _slot: OwnedSemaphorePermit,
) -> Result<DispatchOutcome, DispatchError> {
    let mut delivered = 0usize;
    let mut retries: u32 = 0;
    loop {
        let outcome = transport.put_batch(&config.stream_name, &entries).await?;
        let failed = outcome.failed;
        let accepted = entries.len() - failed.len();
        delivered += accepted;
        counters.delivered.fetch_add(accepted as u64, Ordering::Relaxed);

        if failed.is_empty() {
            return Ok(DispatchOutcome::Delivered { records: delivered });
        }
        if retries >= config.max_retries {
            if config.fail_on_error {
                return Err(DispatchError::RetriesExhausted {
                    records: failed.len(),
                    attempts: retries + 1,
                });
            }
            counters.dropped.fetch_add(failed.len() as u64, Ordering::Relaxed);
            warn!(
                dropped = failed.len(),
                attempts = retries + 1,
                code = %failed[0].code,
                "retry budget spent, dropping records"
            );
            return Ok(DispatchOutcome::Dropped {
                delivered,
                dropped: failed.len(),
            });
        }

        warn!(
            failed = failed.len(),
            retry = retries + 1,
            code = %failed[0].code,
            "partial batch failure, retrying failed subset"
        );
        let keep: HashSet<usize> = failed.iter().map(|f| f.index).collect();
        entries = entries
            .into_iter()
            .enumerate()
            .filter(|(i, _)| keep.contains(i))
            .map(|(_, e)| e)
            .collect();
        // Permits are interchangeable: release one per delivered record.
        permits.truncate(entries.len());

        retries += 1;
        counters.retries.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(backoff(retries, &config)).await;
    }
}

fn backoff(retry: u32, config: &KinesisSinkConfig) -> Duration {
    let exp = retry.saturating_sub(1).min(16);
    let ms = config
        .backoff_base_ms
        .saturating_mul(1u64 << exp)
        .min(config.backoff_cap_ms);
    Duration::from_millis(ms)
}

/// [`SinkTransport`] backed by the AWS Kinesis client.
pub struct KinesisTransport {
    client: aws_sdk_kinesis::Client,
}

impl KinesisTransport {
    pub async fn connect(config: &KinesisSinkConfig) -> Result<Self> {
        let client = crate::kinesis::client_for(&config.region, config.endpoint_url.as_deref()).await;
        Ok(Self { client })
    }
}

#[async_trait]
impl SinkTransport for KinesisTransport {
    async fn put_batch(
        &self,
        stream: &str,
        entries: &[PutEntry],
    ) -> Result<PutBatchOutcome, DispatchError> {
        let records = entries
            .iter()
            .map(|entry| {
                PutRecordsRequestEntry::builder()
                    .partition_key(&entry.routing_key)
                    .data(Blob::new(entry.payload.to_vec()))
                    .build()
                    .map_err(|e| DispatchError::Transport(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let resp = self
            .client
            .put_records()
            .stream_name(stream)
            .set_records(Some(records))
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let failed = resp
            .records()
            .iter()
            .enumerate()
            .filter_map(|(index, result)| {
                result.error_code().map(|code| FailedPut {
                    index,
                    code: code.to_string(),
                    message: result.error_message().unwrap_or_default().to_string(),
                })
            })
            .collect();
        Ok(PutBatchOutcome { failed })
    }
}
