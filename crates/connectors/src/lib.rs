//! Connectors for external data sources and sinks.
//!
//! ## Available Connectors
//!
//! - **Kinesis**: AWS Kinesis Data Streams source and batching sink
//!
//! ## Example
//!
//! ```ignore
//! use conveyor_connectors::kinesis::{KinesisSource, KinesisSourceConfig};
//!
//! let config = KinesisSourceConfig::new("events-source")
//!     .with_region("ap-southeast-1");
//!
//! let source = KinesisSource::connect(config).await?;
//! ```

pub mod kinesis;
