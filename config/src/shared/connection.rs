use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio_postgres::{Config as TokioPgConnectOptions, config::SslMode as TokioPgSslMode};

use crate::SerializableSecretString;
use crate::shared::ValidationError;

/// Session options applied to every connection opened by the consumer.
pub struct DefaultPgConnectionOptions;

impl DefaultPgConnectionOptions {
    /// Returns the options as a string suitable for the tokio-postgres `options` parameter.
    ///
    /// The client encoding must be UTF-8 since change envelopes are decoded as JSON.
    pub fn to_options_string() -> String {
        "-c datestyle=ISO -c intervalstyle=postgres -c extra_float_digits=3 -c client_encoding=UTF8"
            .to_string()
    }
}

/// Configuration for connecting to the source Postgres database.
///
/// The password is redacted in [`std::fmt::Debug`] output. Use
/// [`PgConnectionConfigWithoutSecrets`] to serialize the config, for example for logging.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PgConnectionConfig {
    /// Hostname or IP address of the Postgres server.
    pub host: String,
    /// Port number on which the Postgres server is listening.
    pub port: u16,
    /// Name of the database hosting the replication slot.
    pub name: String,
    /// Username for authenticating with the Postgres server. Needs the `REPLICATION` attribute.
    pub username: String,
    /// Password for the specified user.
    pub password: Option<SerializableSecretString>,
    /// TLS configuration for secure connections.
    pub tls: TlsConfig,
}

impl PgConnectionConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.tls.validate()
    }
}

/// Same as [`PgConnectionConfig`] but without the password, so it is safe to serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PgConnectionConfigWithoutSecrets {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub username: String,
    pub tls_enabled: bool,
}

impl From<PgConnectionConfig> for PgConnectionConfigWithoutSecrets {
    fn from(value: PgConnectionConfig) -> Self {
        PgConnectionConfigWithoutSecrets {
            host: value.host,
            port: value.port,
            name: value.name,
            username: value.username,
            tls_enabled: value.tls.enabled,
        }
    }
}

/// TLS settings for secure Postgres connections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TlsConfig {
    /// PEM-encoded trusted root certificates.
    #[serde(default)]
    pub trusted_root_certs: String,
    /// Whether TLS is enabled for the connection.
    #[serde(default)]
    pub enabled: bool,
}

impl TlsConfig {
    /// Fails with [`ValidationError::MissingTrustedRootCerts`] if TLS is enabled without
    /// certificates.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled && self.trusted_root_certs.is_empty() {
            return Err(ValidationError::MissingTrustedRootCerts);
        }

        Ok(())
    }
}

/// Converts the connection configuration into client specific connect options.
pub trait IntoConnectOptions<Output> {
    /// Creates options for connecting to the server without selecting a database.
    fn without_db(&self) -> Output;

    /// Creates options for connecting to the configured database.
    fn with_db(&self) -> Output;
}

impl IntoConnectOptions<TokioPgConnectOptions> for PgConnectionConfig {
    fn without_db(&self) -> TokioPgConnectOptions {
        let ssl_mode = if self.tls.enabled {
            TokioPgSslMode::Require
        } else {
            TokioPgSslMode::Prefer
        };
        let mut config = TokioPgConnectOptions::new();
        config
            .host(self.host.clone())
            .port(self.port)
            .user(self.username.clone())
            .options(DefaultPgConnectionOptions::to_options_string())
            // Certificates are verified by rustls, the connector only needs to request TLS.
            .ssl_mode(ssl_mode);

        if let Some(password) = &self.password {
            config.password(password.expose_secret());
        }

        config
    }

    fn with_db(&self) -> TokioPgConnectOptions {
        let mut options: TokioPgConnectOptions = self.without_db();
        options.dbname(self.name.clone());
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(tls: TlsConfig) -> PgConnectionConfig {
        PgConnectionConfig {
            host: "localhost".to_string(),
            port: 5432,
            name: "shop".to_string(),
            username: "replicator".to_string(),
            password: Some("secret".to_string().into()),
            tls,
        }
    }

    #[test]
    fn test_tls_without_certificates_is_invalid() {
        let tls = TlsConfig {
            trusted_root_certs: String::new(),
            enabled: true,
        };

        assert_eq!(
            config(tls).validate(),
            Err(ValidationError::MissingTrustedRootCerts)
        );
        assert!(config(TlsConfig::default()).validate().is_ok());
    }

    #[test]
    fn test_with_db_sets_database_and_credentials() {
        let options: TokioPgConnectOptions = config(TlsConfig::default()).with_db();

        assert_eq!(options.get_dbname(), Some("shop"));
        assert_eq!(options.get_user(), Some("replicator"));
        assert_eq!(options.get_ports(), &[5432]);
        assert_eq!(options.get_password(), Some(b"secret".as_slice()));
        assert_eq!(options.get_ssl_mode(), TokioPgSslMode::Prefer);
    }

    #[test]
    fn test_without_secrets_drops_password() {
        let without_secrets: PgConnectionConfigWithoutSecrets =
            config(TlsConfig::default()).into();

        assert_eq!(without_secrets.username, "replicator");
        assert!(!without_secrets.tls_enabled);
    }
}
