//! Built-in operators for the record pipeline.
//!
//! - [`MapOperator`] - Transform each element
//! - [`ProcessingTimeEnricher`] - Stamp records with a processing timestamp
//! - [`KeyByOperator`] - Extract keys for partitioning

mod enrich;
mod keyby;
mod map;

pub use enrich::ProcessingTimeEnricher;
pub use keyby::{session_key, KeyByOperator, KeyedRecord};
pub use map::MapOperator;
