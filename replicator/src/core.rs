use cdc::error::ErrorKind;
use cdc::pipeline::Pipeline;
use cdc::replication::stream::PgReplicationStreamOpener;
use cdc::sink::Sink;
use cdc::sink::counting::CountingSink;
use cdc::sink::logging::LoggingSink;
use config::shared::{PgConnectionConfig, ReplicationConfig, ReplicatorConfig, SinkConfig};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};

use crate::error::ReplicatorResult;

/// Starts the consumer described by `replicator_config` and runs it until a shutdown signal.
pub async fn start_replicator_with_config(
    replicator_config: ReplicatorConfig,
) -> ReplicatorResult<()> {
    info!("starting replicator service");

    log_config(&replicator_config);

    let replication = Arc::new(replicator_config.replication);
    let opener = PgReplicationStreamOpener::new(replicator_config.pg_connection, replication.clone());

    // One arm per sink keeps the pipeline statically dispatched.
    match replicator_config.sink {
        SinkConfig::Logging { level } => {
            let pipeline = Pipeline::new(opener, LoggingSink::new(level), replication);
            start_pipeline(pipeline).await?;
        }
        SinkConfig::Counting { log_every } => {
            let pipeline = Pipeline::new(opener, CountingSink::new(log_every), replication);
            start_pipeline(pipeline).await?;
        }
    }

    info!("replicator service completed");

    Ok(())
}

fn log_config(config: &ReplicatorConfig) {
    log_pg_connection_config(&config.pg_connection);
    log_replication_config(&config.replication);
    debug!(sink = ?config.sink, "sink config");
}

fn log_pg_connection_config(config: &PgConnectionConfig) {
    debug!(
        host = config.host,
        port = config.port,
        dbname = config.name,
        username = config.username,
        tls_enabled = config.tls.enabled,
        "source postgres connection config",
    );
}

fn log_replication_config(config: &ReplicationConfig) {
    debug!(
        slot_name = config.slot_name,
        schema_name = config.schema_name,
        table_name = config.table_name,
        output_plugin = config.output_plugin,
        status_interval_ms = config.status_interval_ms,
        poll_interval_ms = config.poll_interval_ms,
        publish_failure_policy = ?config.publish_failure_policy,
        "replication config"
    );
}

/// Starts `pipeline` and shuts it down once SIGINT or SIGTERM is received.
///
/// The consumer only stops on shutdown or when it fails, so the process exits as soon as the
/// worker does. On a signal the consumer gets the shutdown timeout to stop before it is aborted.
#[tracing::instrument(skip(pipeline))]
async fn start_pipeline<S>(mut pipeline: Pipeline<PgReplicationStreamOpener, S>) -> ReplicatorResult<()>
where
    S: Sink + Send + Sync + 'static,
{
    pipeline.start();

    // Sent by Kubernetes before SIGKILL during pod termination.
    let mut sigterm = signal(SignalKind::terminate())?;

    let shutdown_tx = pipeline.shutdown_tx();
    let shutdown_handle = tokio::spawn(async move {
        let sigint = tokio::select! {
            result = tokio::signal::ctrl_c() => Some(result),
            _ = sigterm.recv() => None,
        };

        match sigint {
            Some(Ok(())) => info!("sigint (ctrl+c) received, shutting down pipeline"),
            Some(Err(err)) => {
                warn!(error = %err, "failed to listen for sigint, waiting for sigterm only");
                sigterm.recv().await;
                info!("sigterm received, shutting down pipeline");
            }
            None => info!("sigterm received, shutting down pipeline"),
        }

        if let Err(err) = shutdown_tx.shutdown() {
            warn!(error = ?err, "failed to send shutdown signal");
        }
    });

    let result = pipeline.wait_with_shutdown_timeout().await;

    // Still running when the worker stopped on its own.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    if let Err(err) = result {
        if err.kind() == ErrorKind::ShutdownTimeout {
            error!(error = %err, "pipeline was aborted during shutdown");
        }

        return Err(err.into());
    }

    info!("pipeline stopped");

    Ok(())
}
