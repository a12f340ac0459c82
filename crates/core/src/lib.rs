//! Core types shared across the engine.

pub mod error;
pub mod record;

pub use error::{DecodeError, DispatchError, SchemaError};
pub use record::{Record, PROCESSING_TIME_FIELD, SESSION_ID_FIELD};

/// Key a record is partitioned by between key extraction and buffering.
pub type PartitionKey = String;

/// Messages flowing through operator edges.
#[derive(Debug, Clone)]
pub enum StreamMessage<T> {
    Data(T),
    /// End of stream (for bounded inputs / controlled shutdown).
    End,
}
