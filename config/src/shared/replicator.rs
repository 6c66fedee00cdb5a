use serde::{Deserialize, Serialize};

use crate::Config;
use crate::shared::{
    PgConnectionConfig, PgConnectionConfigWithoutSecrets, ReplicationConfig, SinkConfig,
    ValidationError,
};

/// Complete configuration of the replicator binary.
///
/// This intentionally does not implement [`Serialize`] to avoid accidentally leaking secrets
/// in the config into serialized forms.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicatorConfig {
    /// Connection to the source database.
    pub pg_connection: PgConnectionConfig,
    /// Slot and table to consume.
    pub replication: ReplicationConfig,
    /// Where extracted rows are published. Defaults to the logging sink.
    #[serde(default)]
    pub sink: SinkConfig,
}

impl ReplicatorConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.pg_connection.validate()?;
        self.replication.validate()?;
        self.sink.validate()
    }
}

impl Config for ReplicatorConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        ReplicatorConfig::validate(self)
    }
}

/// Same as [`ReplicatorConfig`] but without secrets, so it is safe to serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfigWithoutSecrets {
    pub pg_connection: PgConnectionConfigWithoutSecrets,
    pub replication: ReplicationConfig,
    pub sink: SinkConfig,
}

impl From<ReplicatorConfig> for ReplicatorConfigWithoutSecrets {
    fn from(value: ReplicatorConfig) -> Self {
        ReplicatorConfigWithoutSecrets {
            pg_connection: value.pg_connection.into(),
            replication: value.replication,
            sink: value.sink,
        }
    }
}
