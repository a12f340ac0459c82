//! KeyBy operator implementation.

use anyhow::Result;
use async_trait::async_trait;
use conveyor_core::{PartitionKey, Record, StreamMessage};
use conveyor_runtime::{Emitter, Operator};
use std::marker::PhantomData;

/// A keyed record with extracted key.
#[derive(Debug, Clone)]
pub struct KeyedRecord<K, T> {
    /// The extracted key.
    pub key: K,
    /// The original value.
    pub value: T,
}

/// KeyBy extracts a key from each element for downstream keyed handling.
///
/// Records with equal keys leave this operator in the order they arrived;
/// the single bounded channel per edge carries that FIFO order through to
/// buffer admission.
///
/// # Example
///
/// ```ignore
/// let by_session = KeyByOperator::new(session_key);
/// ```
pub struct KeyByOperator<F, T, K> {
    key_selector: F,
    _phantom: PhantomData<(T, K)>,
}

impl<F, T, K> KeyByOperator<F, T, K>
where
    F: Fn(&T) -> K + Send + 'static,
    T: Send + 'static,
    K: Send + 'static,
{
    /// Create a new keyby operator with the given key selector function.
    pub fn new(key_selector: F) -> Self {
        Self {
            key_selector,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, T, K> Operator for KeyByOperator<F, T, K>
where
    F: Fn(&T) -> K + Send + 'static,
    T: Send + 'static,
    K: Send + 'static,
{
    type In = T;
    type Out = KeyedRecord<K, T>;

    async fn on_message(
        &mut self,
        msg: StreamMessage<Self::In>,
        out: &mut Emitter<Self::Out>,
    ) -> Result<()> {
        match msg {
            StreamMessage::Data(v) => {
                let key = (self.key_selector)(&v);
                out.data(KeyedRecord { key, value: v }).await
            }
            StreamMessage::End => out.end().await,
        }
    }
}

/// Key selector for session-keyed records: the `session_id` field verbatim.
///
/// Records reaching the keyer were validated by the enricher; an absent key
/// maps to the empty session rather than failing the stream.
pub fn session_key(record: &Record) -> PartitionKey {
    record.session_id().map(str::to_owned).unwrap_or_default()
}
