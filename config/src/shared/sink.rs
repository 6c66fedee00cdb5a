use serde::{Deserialize, Serialize};

const fn default_log_every() -> u64 {
    1
}

/// Level at which the logging sink emits rows.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SinkLogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Sink receiving the rows extracted from the replication slot.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SinkConfig {
    /// Logs every row as JSON.
    Logging {
        #[serde(default)]
        level: SinkLogLevel,
    },
    /// Counts rows and logs the running total every `log_every` rows.
    Counting {
        #[serde(default = "default_log_every")]
        log_every: u64,
    },
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Logging {
            level: SinkLogLevel::default(),
        }
    }
}

impl SinkConfig {
    pub fn validate(&self) -> Result<(), crate::shared::ValidationError> {
        if let SinkConfig::Counting { log_every: 0 } = self {
            return Err(crate::shared::ValidationError::InvalidSink(
                "`log_every` must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_variants_deserialize() {
        let logging: SinkConfig = serde_json::from_str(r#"{"logging": {"level": "debug"}}"#).unwrap();
        let counting: SinkConfig = serde_json::from_str(r#"{"counting": {}}"#).unwrap();

        assert_eq!(
            logging,
            SinkConfig::Logging {
                level: SinkLogLevel::Debug
            }
        );
        assert_eq!(counting, SinkConfig::Counting { log_every: 1 });
    }

    #[test]
    fn test_counting_sink_requires_positive_interval() {
        assert!(SinkConfig::Counting { log_every: 0 }.validate().is_err());
        assert!(SinkConfig::default().validate().is_ok());
    }
}
