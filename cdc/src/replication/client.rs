use config::shared::{IntoConnectOptions, PgConnectionConfig};
use pg_escape::{quote_identifier, quote_literal};
use postgres_replication::ReplicationStream;
use rustls::ClientConfig;
use std::collections::BTreeMap;
use std::io::BufReader;
use tokio_postgres::error::SqlState;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{
    Client, Config, Connection, NoTls, SimpleQueryMessage, SimpleQueryRow, Socket,
    config::ReplicationMode, types::PgLsn,
};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{Instrument, error, info};

use crate::error::{CdcResult, ErrorKind};
use crate::{bail, cdc_error};

/// Spawns a background task driving a Postgres connection until it terminates.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        match connection.await {
            Err(err) => error!(error = %err, "an error occurred during the postgres connection"),
            Ok(()) => info!("postgres connection terminated successfully"),
        }
    }
    .instrument(span);

    // The connection ends when its `Client` is dropped, so the task is not tracked.
    tokio::spawn(task);
}

/// Result returned when creating a new replication slot.
#[derive(Debug, Clone)]
pub struct CreateSlotResult {
    /// The LSN from which the slot emits changes.
    pub consistent_point: PgLsn,
}

/// A connection to Postgres in logical replication mode.
///
/// Replication commands are only accepted on such connections, so the client is dedicated to a
/// single stream and is dropped with it.
#[derive(Debug)]
pub struct PgReplicationClient {
    client: Client,
}

impl PgReplicationClient {
    /// Connects to Postgres in logical replication mode, using TLS if it is enabled in
    /// `pg_connection_config`.
    pub async fn connect(pg_connection_config: &PgConnectionConfig) -> CdcResult<Self> {
        match pg_connection_config.tls.enabled {
            true => PgReplicationClient::connect_tls(pg_connection_config).await,
            false => PgReplicationClient::connect_no_tls(pg_connection_config).await,
        }
    }

    async fn connect_no_tls(pg_connection_config: &PgConnectionConfig) -> CdcResult<Self> {
        let mut config: Config = pg_connection_config.with_db();
        config.replication_mode(ReplicationMode::Logical);

        let (client, connection) = config.connect(NoTls).await?;
        spawn_postgres_connection::<NoTls>(connection);

        info!(host = %pg_connection_config.host, "connected to postgres without tls");

        Ok(PgReplicationClient { client })
    }

    async fn connect_tls(pg_connection_config: &PgConnectionConfig) -> CdcResult<Self> {
        let mut config: Config = pg_connection_config.with_db();
        config.replication_mode(ReplicationMode::Logical);

        let mut root_store = rustls::RootCertStore::empty();
        let mut root_certs_reader =
            BufReader::new(pg_connection_config.tls.trusted_root_certs.as_bytes());
        for cert in rustls_pemfile::certs(&mut root_certs_reader) {
            let cert = cert?;
            root_store.add(cert)?;
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let (client, connection) = config.connect(MakeRustlsConnect::new(tls_config)).await?;
        spawn_postgres_connection::<MakeRustlsConnect>(connection);

        info!(host = %pg_connection_config.host, "connected to postgres with tls");

        Ok(PgReplicationClient { client })
    }

    /// Checks if the underlying connection is closed.
    pub fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    /// Creates a logical replication slot decoded by `output_plugin`, without exporting a snapshot.
    ///
    /// Fails with [`ErrorKind::ReplicationSlotAlreadyExists`] if the slot exists.
    pub async fn create_slot(
        &self,
        slot_name: &str,
        output_plugin: &str,
    ) -> CdcResult<CreateSlotResult> {
        // Replication commands must stay uppercase, the replication command lexer of Postgres
        // does not accept them otherwise.
        let query = format!(
            r#"CREATE_REPLICATION_SLOT {} LOGICAL {} NOEXPORT_SNAPSHOT"#,
            quote_identifier(slot_name),
            quote_identifier(output_plugin)
        );

        let results = match self.client.simple_query(&query).await {
            Ok(results) => results,
            Err(err) => {
                if let Some(code) = err.code()
                    && *code == SqlState::DUPLICATE_OBJECT
                {
                    bail!(
                        ErrorKind::ReplicationSlotAlreadyExists,
                        "Replication slot already exists",
                        format!("Replication slot '{slot_name}' already exists in database"),
                        source: err
                    );
                }

                return Err(err.into());
            }
        };

        for result in results {
            if let SimpleQueryMessage::Row(row) = result {
                let consistent_point = Self::get_row_value::<PgLsn>(&row, "consistent_point")?;

                return Ok(CreateSlotResult { consistent_point });
            }
        }

        Err(cdc_error!(
            ErrorKind::ReplicationSlotNotCreated,
            "Replication slot creation failed",
            format!("Creating replication slot '{slot_name}' returned no consistent point")
        ))
    }

    /// Starts streaming changes of `slot_name` from `start_lsn`.
    ///
    /// A `start_lsn` of `0/0` makes the server resume from the slot's confirmed flush position.
    /// Each entry of `options` is passed to the output plugin.
    pub async fn start_logical_replication(
        &self,
        slot_name: &str,
        start_lsn: PgLsn,
        options: &BTreeMap<String, String>,
    ) -> CdcResult<ReplicationStream> {
        info!(slot_name, %start_lsn, "starting logical replication");

        let query = format!(
            r#"START_REPLICATION SLOT {} LOGICAL {}{}"#,
            quote_identifier(slot_name),
            start_lsn,
            format_plugin_options(options)
        );

        let copy_stream = self.client.copy_both_simple::<bytes::Bytes>(&query).await?;

        Ok(ReplicationStream::new(copy_stream))
    }

    fn get_row_value<T: std::str::FromStr>(row: &SimpleQueryRow, column_name: &str) -> CdcResult<T>
    where
        T::Err: std::fmt::Debug,
    {
        let value = row.try_get(column_name)?.ok_or(cdc_error!(
            ErrorKind::SourceQueryFailed,
            "Column not found in replication command result",
            format!("Column '{column_name}' is missing or null")
        ))?;

        value.parse().map_err(|e: T::Err| {
            cdc_error!(
                ErrorKind::ConversionError,
                "Column parsing failed",
                format!("Failed to parse value '{value}' of column '{column_name}': {e:?}")
            )
        })
    }
}

/// Renders output plugin options as ` ("name" 'value', ...)`, or nothing if there are none.
fn format_plugin_options(options: &BTreeMap<String, String>) -> String {
    if options.is_empty() {
        return String::new();
    }

    let options = options
        .iter()
        .map(|(name, value)| format!("{} {}", quote_identifier(name), quote_literal(value)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(" ({options})")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_options_are_quoted() {
        let options = BTreeMap::from([
            ("include-xids".to_string(), "true".to_string()),
            ("pretty-print".to_string(), "0".to_string()),
        ]);

        assert_eq!(
            format_plugin_options(&options),
            r#" ("include-xids" 'true', "pretty-print" '0')"#
        );
    }

    #[test]
    fn test_no_plugin_options_render_nothing() {
        assert_eq!(format_plugin_options(&BTreeMap::new()), "");
    }
}
