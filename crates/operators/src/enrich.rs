//! Processing-time enrichment.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use conveyor_core::{Record, SchemaError, StreamMessage, PROCESSING_TIME_FIELD};
use conveyor_runtime::{Emitter, Operator};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Stamps each record with the current processing time.
///
/// Adds exactly one field, [`PROCESSING_TIME_FIELD`]; existing fields are
/// never removed or renamed, and re-running the enricher overwrites the
/// stamp rather than duplicating it.
///
/// A record without a valid `session_id` is not forwarded: it is counted,
/// logged, and routed to the dead-letter channel when one is configured.
pub struct ProcessingTimeEnricher {
    dead_letter: Option<mpsc::Sender<(Record, SchemaError)>>,
    skipped: Arc<AtomicU64>,
}

impl ProcessingTimeEnricher {
    pub fn new() -> Self {
        Self {
            dead_letter: None,
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Route schema-invalid records to `tx` instead of dropping them.
    pub fn with_dead_letter(mut self, tx: mpsc::Sender<(Record, SchemaError)>) -> Self {
        self.dead_letter = Some(tx);
        self
    }

    /// Counter of records skipped for schema errors.
    pub fn skipped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.skipped)
    }
}

impl Default for ProcessingTimeEnricher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operator for ProcessingTimeEnricher {
    type In = Record;
    type Out = Record;

    async fn on_message(
        &mut self,
        msg: StreamMessage<Record>,
        out: &mut Emitter<Record>,
    ) -> Result<()> {
        match msg {
            StreamMessage::Data(mut record) => {
                if let Err(e) = record.session_id() {
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, record = %record.snippet(), "schema error, record not forwarded");
                    if let Some(tx) = &self.dead_letter {
                        if tx.send((record, e)).await.is_err() {
                            debug!("dead-letter channel closed");
                        }
                    }
                    return Ok(());
                }
                record.set_string(PROCESSING_TIME_FIELD, processing_timestamp());
                out.data(record).await
            }
            StreamMessage::End => out.end().await,
        }
    }
}

/// Current wall-clock time as an ISO-8601 string.
fn processing_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_runtime::{spawn_operator, stream_channel};

    fn record(json: &str) -> Record {
        Record::decode(json.as_bytes()).unwrap()
    }

    async fn run_enricher(
        enricher: ProcessingTimeEnricher,
        inputs: Vec<Record>,
    ) -> Vec<Record> {
        let (tx0, rx0) = stream_channel::<Record>(8);
        let (tx1, mut rx1) = stream_channel::<Record>(8);
        let handle = spawn_operator("enrich", enricher, rx0, tx1);

        for r in inputs {
            tx0.send(StreamMessage::Data(r)).await.unwrap();
        }
        tx0.send(StreamMessage::End).await.unwrap();

        let mut out = Vec::new();
        while let Some(msg) = rx1.recv().await {
            match msg {
                StreamMessage::Data(r) => out.push(r),
                StreamMessage::End => break,
            }
        }
        handle.await.unwrap().unwrap();
        out
    }

    #[tokio::test]
    async fn stamps_processing_time() {
        let out = run_enricher(
            ProcessingTimeEnricher::new(),
            vec![record(r#"{"session_id":"s1","v":1}"#)],
        )
        .await;

        assert_eq!(out.len(), 1);
        let stamp = out[0].get(PROCESSING_TIME_FIELD).unwrap().as_str().unwrap();
        assert!(stamp.contains('T'), "not an ISO-8601 timestamp: {stamp}");
        // Existing fields untouched.
        assert_eq!(out[0].session_id().unwrap(), "s1");
        assert_eq!(out[0].get("v").unwrap().as_i64().unwrap(), 1);
        assert_eq!(out[0].len(), 3);
    }

    #[tokio::test]
    async fn re_enrichment_overwrites_instead_of_duplicating() {
        let pre_stamped = record(
            r#"{"session_id":"s1","flink_processing_eventtime":"1970-01-01T00:00:00Z"}"#,
        );
        let out = run_enricher(ProcessingTimeEnricher::new(), vec![pre_stamped]).await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 2);
        let stamp = out[0].get(PROCESSING_TIME_FIELD).unwrap().as_str().unwrap();
        assert_ne!(stamp, "1970-01-01T00:00:00Z");
    }

    #[tokio::test]
    async fn missing_session_id_is_dropped_and_counted() {
        let enricher = ProcessingTimeEnricher::new();
        let skipped = enricher.skipped_counter();
        let out = run_enricher(
            enricher,
            vec![
                record(r#"{"v":1}"#),
                record(r#"{"session_id":"s1","v":2}"#),
            ],
        )
        .await;

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("v").unwrap().as_i64().unwrap(), 2);
        assert_eq!(skipped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn schema_errors_route_to_dead_letter() {
        let (dl_tx, mut dl_rx) = mpsc::channel(8);
        let enricher = ProcessingTimeEnricher::new().with_dead_letter(dl_tx);
        let out = run_enricher(enricher, vec![record(r#"{"session_id":7}"#)]).await;

        assert!(out.is_empty());
        let (dead, err) = dl_rx.recv().await.unwrap();
        assert_eq!(dead.get("session_id").unwrap().as_i64().unwrap(), 7);
        assert!(matches!(err, SchemaError::WrongType { .. }));
    }
}
