//! Job configuration.
//!
//! Everything the pipeline needs arrives through one explicit JSON file;
//! core components never inspect the environment themselves.

use anyhow::{bail, Context, Result};
use conveyor_connectors::kinesis::{KinesisSinkConfig, KinesisSourceConfig};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// What to do with records that fail schema validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchemaErrorPolicy {
    /// Count, log, and discard.
    #[default]
    Drop,
    /// Route to the dead-letter log.
    DeadLetter,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub source: KinesisSourceConfig,
    pub sink: KinesisSinkConfig,

    /// Capacity of the bounded queues between pipeline stages.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    #[serde(default)]
    pub schema_errors: SchemaErrorPolicy,
}

fn default_channel_capacity() -> usize {
    32
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig =
            serde_json::from_str(&contents).context("parsing config file")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.source.stream_name.is_empty() {
            bail!("source.stream_name must be set");
        }
        if self.sink.stream_name.is_empty() {
            bail!("sink.stream_name must be set");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "source": { "stream_name": "events-in", "region": "ap-southeast-1" },
                "sink": { "stream_name": "events-out", "region": "ap-southeast-1" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.source.stream_name, "events-in");
        assert_eq!(config.sink.max_batch_records, 500);
        assert_eq!(config.sink.max_batch_bytes, 5 * 1024 * 1024);
        assert_eq!(config.sink.max_buffer_time_ms, 5000);
        assert!(config.sink.fail_on_error);
        assert_eq!(config.channel_capacity, 32);
        assert_eq!(config.schema_errors, SchemaErrorPolicy::Drop);
    }

    #[test]
    fn sink_thresholds_are_overridable() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "source": { "stream_name": "in" },
                "sink": {
                    "stream_name": "out",
                    "max_batch_records": 100,
                    "fail_on_error": false,
                    "admission_timeout_ms": 30000
                },
                "schema_errors": "dead-letter"
            }"#,
        )
        .unwrap();

        assert_eq!(config.sink.max_batch_records, 100);
        assert!(!config.sink.fail_on_error);
        assert_eq!(config.sink.admission_timeout_ms, Some(30_000));
        assert_eq!(config.schema_errors, SchemaErrorPolicy::DeadLetter);
    }

    #[test]
    fn missing_stream_name_is_rejected() {
        let config: AppConfig = serde_json::from_str(
            r#"{ "source": { "stream_name": "in" }, "sink": {} }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
