use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

const fn default_status_interval_ms() -> u64 {
    ReplicationConfig::DEFAULT_STATUS_INTERVAL_MS
}

const fn default_poll_interval_ms() -> u64 {
    ReplicationConfig::DEFAULT_POLL_INTERVAL_MS
}

fn default_output_plugin() -> String {
    ReplicationConfig::DEFAULT_OUTPUT_PLUGIN.to_string()
}

fn default_slot_options() -> BTreeMap<String, String> {
    BTreeMap::from([("include-xids".to_string(), "true".to_string())])
}

/// What the consumer does with a change envelope when the sink rejects one of its rows.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PublishFailurePolicy {
    /// Leave the envelope unacknowledged and reconnect, so the source sends it again.
    ///
    /// Rows published before the failing one are published again, which is allowed by
    /// at-least-once delivery.
    #[default]
    Redeliver,
    /// Log the rejected row and keep consuming. The row is lost once a later cursor is
    /// acknowledged.
    Skip,
}

/// Settings of the replication slot and of the table whose inserts are consumed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Name of the logical replication slot. Created on first use.
    pub slot_name: String,
    /// Schema of the consumed table, matched case-insensitively.
    pub schema_name: String,
    /// Name of the consumed table, matched case-insensitively.
    pub table_name: String,
    /// Maximum time between two standby status updates sent to the source.
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    /// Time to wait after an empty poll and before reopening a failed stream.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Logical decoding output plugin the slot is created with.
    ///
    /// The plugin must emit wal2json format version 1 envelopes.
    #[serde(default = "default_output_plugin")]
    pub output_plugin: String,
    /// Options passed to the output plugin when replication starts.
    #[serde(default = "default_slot_options")]
    pub slot_options: BTreeMap<String, String>,
    #[serde(default)]
    pub publish_failure_policy: PublishFailurePolicy,
}

impl ReplicationConfig {
    pub const DEFAULT_STATUS_INTERVAL_MS: u64 = 5000;

    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

    pub const DEFAULT_OUTPUT_PLUGIN: &'static str = "wal2json";

    /// Creates a config for `slot_name` consuming `schema_name`.`table_name` with defaults for
    /// everything else.
    pub fn new(
        slot_name: impl Into<String>,
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        Self {
            slot_name: slot_name.into(),
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            status_interval_ms: Self::DEFAULT_STATUS_INTERVAL_MS,
            poll_interval_ms: Self::DEFAULT_POLL_INTERVAL_MS,
            output_plugin: default_output_plugin(),
            slot_options: default_slot_options(),
            publish_failure_policy: PublishFailurePolicy::default(),
        }
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Checks that every name is set and every interval is positive.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let names = [
            ("slot_name", &self.slot_name),
            ("schema_name", &self.schema_name),
            ("table_name", &self.table_name),
            ("output_plugin", &self.output_plugin),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(ValidationError::EmptyName(field));
            }
        }

        if self.status_interval_ms == 0 {
            return Err(ValidationError::ZeroInterval("status_interval_ms"));
        }

        if self.poll_interval_ms == 0 {
            return Err(ValidationError::ZeroInterval("poll_interval_ms"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_applied() {
        let config: ReplicationConfig = serde_json::from_str(
            r#"{"slot_name": "orders_slot", "schema_name": "public", "table_name": "orders"}"#,
        )
        .unwrap();

        assert_eq!(config.poll_interval(), Duration::from_millis(1000));
        assert_eq!(config.status_interval(), Duration::from_millis(5000));
        assert_eq!(config.output_plugin, "wal2json");
        assert_eq!(
            config.slot_options.get("include-xids").map(String::as_str),
            Some("true")
        );
        assert_eq!(config.publish_failure_policy, PublishFailurePolicy::Redeliver);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_policy_is_snake_case() {
        let policy: PublishFailurePolicy = serde_json::from_str(r#""skip""#).unwrap();

        assert_eq!(policy, PublishFailurePolicy::Skip);
    }

    #[test]
    fn test_empty_names_are_rejected() {
        let mut config = ReplicationConfig::new("orders_slot", "public", "orders");
        config.table_name = " ".to_string();

        assert_eq!(
            config.validate(),
            Err(ValidationError::EmptyName("table_name"))
        );
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        let mut config = ReplicationConfig::new("orders_slot", "public", "orders");
        config.poll_interval_ms = 0;

        assert_eq!(
            config.validate(),
            Err(ValidationError::ZeroInterval("poll_interval_ms"))
        );

        config.poll_interval_ms = 10;
        config.status_interval_ms = 0;

        assert_eq!(
            config.validate(),
            Err(ValidationError::ZeroInterval("status_interval_ms"))
        );
    }
}
