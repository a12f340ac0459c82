//! In-memory stream doubles for wiring tests.
//!
//! [`InMemoryStream`] stands in for the origin stream (one partition,
//! index-valued cursors); [`InMemoryTransport`] stands in for the
//! destination, with scriptable per-record rejections and call faults.

use crate::kinesis::config::InitialPosition;
use crate::kinesis::sink::{FailedPut, PutBatchOutcome, PutEntry, SinkTransport};
use crate::kinesis::source::{ReadPage, StreamFetcher};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use conveyor_core::DispatchError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Default)]
struct StreamState {
    messages: Vec<Bytes>,
    closed: bool,
    /// Highest message index any cursor has read past.
    read_to: usize,
}

/// A single-partition in-memory stream.
#[derive(Clone, Default)]
pub struct InMemoryStream {
    state: Arc<Mutex<StreamState>>,
}

impl InMemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message to the stream.
    pub fn push(&self, payload: impl AsRef<[u8]>) {
        self.state
            .lock()
            .messages
            .push(Bytes::copy_from_slice(payload.as_ref()));
    }

    /// Mark the stream as ended: readers reach end-of-stream once they
    /// consume what is already appended.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Highest message index the reader has advanced past.
    pub fn position(&self) -> usize {
        self.state.lock().read_to
    }
}

#[async_trait]
impl StreamFetcher for InMemoryStream {
    async fn partitions(&mut self) -> Result<Vec<String>> {
        Ok(vec!["shardId-000000000000".to_string()])
    }

    async fn open_cursor(&mut self, _partition: &str, position: InitialPosition) -> Result<String> {
        let state = self.state.lock();
        let at = match position {
            InitialPosition::TrimHorizon => 0,
            InitialPosition::Latest => state.messages.len(),
        };
        Ok(at.to_string())
    }

    async fn read(&mut self, cursor: &str, limit: i32) -> Result<ReadPage> {
        let mut state = self.state.lock();
        let at: usize = cursor.parse()?;
        let end = (at + limit.max(0) as usize).min(state.messages.len());
        let payloads = state.messages[at..end].to_vec();
        state.read_to = state.read_to.max(end);
        let next_cursor = if state.closed && end >= state.messages.len() {
            None
        } else {
            Some(end.to_string())
        };
        Ok(ReadPage {
            payloads,
            next_cursor,
        })
    }
}

#[derive(Default)]
struct TransportState {
    /// Every submitted batch, in submission order.
    batches: Vec<Vec<PutEntry>>,
    /// Accepted records in acceptance order.
    deliveries: Vec<PutEntry>,
    /// Payload -> remaining scripted rejections.
    rejections: HashMap<Vec<u8>, u32>,
    /// Payload substring -> remaining scripted rejections.
    substring_rejections: Vec<(Vec<u8>, u32)>,
    /// Remaining whole-call faults.
    faulted_calls: u32,
}

/// A destination double recording deliveries and replaying scripted
/// failures.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<Mutex<TransportState>>,
    /// When present, each call consumes one permit before proceeding.
    gate: Option<Arc<Semaphore>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose calls park until the returned gate hands out a
    /// permit. Lets tests hold batches in flight.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (
            Self {
                state: Arc::default(),
                gate: Some(Arc::clone(&gate)),
            },
            gate,
        )
    }

    /// Reject this payload the next `times` times it is submitted.
    pub fn reject_payload(&self, payload: &[u8], times: u32) {
        self.state.lock().rejections.insert(payload.to_vec(), times);
    }

    /// Reject payloads containing `needle` the next `times` times one is
    /// submitted. Useful when the exact payload is produced upstream.
    pub fn reject_matching(&self, needle: &str, times: u32) {
        self.state
            .lock()
            .substring_rejections
            .push((needle.as_bytes().to_vec(), times));
    }

    /// Fail the next `times` calls at the transport level.
    pub fn fail_calls(&self, times: u32) {
        self.state.lock().faulted_calls = times;
    }

    /// Every submitted batch's payloads, in submission order.
    pub fn batches(&self) -> Vec<Vec<Bytes>> {
        self.state
            .lock()
            .batches
            .iter()
            .map(|batch| batch.iter().map(|e| e.payload.clone()).collect())
            .collect()
    }

    /// Accepted payloads in acceptance order.
    pub fn deliveries(&self) -> Vec<Bytes> {
        self.state
            .lock()
            .deliveries
            .iter()
            .map(|e| e.payload.clone())
            .collect()
    }

    /// Routing keys of accepted records, in acceptance order.
    pub fn routing_keys(&self) -> Vec<String> {
        self.state
            .lock()
            .deliveries
            .iter()
            .map(|e| e.routing_key.clone())
            .collect()
    }
}

#[async_trait]
impl SinkTransport for InMemoryTransport {
    async fn put_batch(
        &self,
        _stream: &str,
        entries: &[PutEntry],
    ) -> Result<PutBatchOutcome, DispatchError> {
        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| DispatchError::Transport("gate closed".to_string()))?;
            permit.forget();
        }

        let mut state = self.state.lock();
        if state.faulted_calls > 0 {
            state.faulted_calls -= 1;
            return Err(DispatchError::Transport(
                "injected transport failure".to_string(),
            ));
        }

        state.batches.push(entries.to_vec());

        let mut failed = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            let mut reject = match state.rejections.get_mut(entry.payload.as_ref()) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            if !reject {
                for (needle, remaining) in state.substring_rejections.iter_mut() {
                    if *remaining > 0 && contains(entry.payload.as_ref(), needle) {
                        *remaining -= 1;
                        reject = true;
                        break;
                    }
                }
            }
            if reject {
                failed.push(FailedPut {
                    index,
                    code: "ProvisionedThroughputExceededException".to_string(),
                    message: "injected rejection".to_string(),
                });
            } else {
                state.deliveries.push(entry.clone());
            }
        }
        Ok(PutBatchOutcome { failed })
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}
