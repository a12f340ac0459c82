//! Error taxonomy for the record pipeline.
//!
//! Per-record errors (`DecodeError`, `SchemaError`) never abort a batch or
//! the run; `DispatchError` variants mark the terminal failures that do.

use std::time::Duration;
use thiserror::Error;

/// A single source message could not be decoded into a [`Record`].
///
/// The reader skips the message and keeps consuming.
///
/// [`Record`]: crate::Record
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is valid JSON but not an object (found {found})")]
    NotAnObject { found: &'static str },
}

/// A well-formed record is missing a field an operation requires.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("record is missing required field `{field}`")]
    MissingField { field: &'static str },
    #[error("field `{field}` must be a string, found {found}")]
    WrongType {
        field: &'static str,
        found: &'static str,
    },
}

/// Terminal failures on the delivery path.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The destination call itself failed (connection-level fault).
    #[error("destination transport failure: {0}")]
    Transport(String),

    /// Records were still rejected after the retry budget was spent.
    #[error("{records} record(s) still failing after {attempts} delivery attempts")]
    RetriesExhausted { records: usize, attempts: u32 },

    /// A single encoded record can never fit a destination batch.
    #[error("record of {size} bytes exceeds destination limit of {limit} bytes")]
    OversizedRecord { size: usize, limit: usize },

    /// Admission stayed blocked past the configured bound.
    #[error("admission blocked longer than {}ms", timeout.as_millis())]
    BackpressureTimeout { timeout: Duration },
}
