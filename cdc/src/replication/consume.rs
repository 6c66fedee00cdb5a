use bytes::Bytes;
use config::shared::{PublishFailurePolicy, ReplicationConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::PgLsn;
use tracing::{debug, error, info, warn};

use crate::cdc_error;
use crate::concurrency::shutdown::{ShutdownRx, is_shutdown_requested};
use crate::envelope::Envelope;
use crate::error::{CdcError, CdcResult, ErrorKind};
use crate::replication::stream::{ReplicationStream, ReplicationStreamOpener};
use crate::sink::Sink;
use crate::types::PollResult;

/// Why consumption of a single stream stopped.
#[derive(Debug)]
enum StreamExit {
    /// Shutdown was requested.
    Shutdown,
    /// The stream failed and has to be reopened.
    Reconnect(CdcError),
}

/// Waits for `duration` unless shutdown is requested first.
///
/// Returns `true` if shutdown was requested.
async fn sleep_or_shutdown(duration: Duration, shutdown_rx: &mut ShutdownRx) -> bool {
    tokio::select! {
        biased;

        _ = shutdown_rx.changed() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Consumes the configured slot until shutdown is requested.
///
/// Streams are opened through `opener` and reopened after every failure. Inserts on the
/// configured table are published to `sink` and acknowledged once all rows of their envelope
/// were published.
pub async fn start_consume_loop<O, S>(
    opener: O,
    sink: S,
    config: Arc<ReplicationConfig>,
    shutdown_rx: ShutdownRx,
) -> CdcResult<()>
where
    O: ReplicationStreamOpener,
    S: Sink + Send + Sync,
{
    ConsumeLoop {
        opener,
        sink,
        config,
        shutdown_rx,
    }
    .run()
    .await
}

struct ConsumeLoop<O, S> {
    opener: O,
    sink: S,
    config: Arc<ReplicationConfig>,
    shutdown_rx: ShutdownRx,
}

impl<O, S> ConsumeLoop<O, S>
where
    O: ReplicationStreamOpener,
    S: Sink + Send + Sync,
{
    async fn run(mut self) -> CdcResult<()> {
        let slot_name = self.config.slot_name.clone();
        let poll_interval = self.config.poll_interval();

        info!(
            %slot_name,
            schema_name = %self.config.schema_name,
            table_name = %self.config.table_name,
            sink = S::name(),
            "starting consume loop"
        );

        loop {
            if is_shutdown_requested(&self.shutdown_rx) {
                break;
            }

            let opened = tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => break,
                opened = self.opener.open() => opened,
            };

            let mut stream = match opened {
                Ok(stream) => stream,
                Err(err) => {
                    if err.kind() == ErrorKind::ReplicationSlotBusy {
                        warn!(
                            %slot_name,
                            error = %err,
                            "replication slot is in use, retrying in {:?}",
                            poll_interval
                        );
                    } else {
                        error!(
                            %slot_name,
                            error = %err,
                            "failed to open replication stream, retrying in {:?}",
                            poll_interval
                        );
                    }

                    if sleep_or_shutdown(poll_interval, &mut self.shutdown_rx).await {
                        break;
                    }

                    continue;
                }
            };

            info!(%slot_name, "replication stream opened");

            let exit = self.consume(&mut stream).await;
            stream.close().await;

            match exit {
                StreamExit::Shutdown => break,
                StreamExit::Reconnect(err) => {
                    error!(
                        %slot_name,
                        error = %err,
                        "replication stream failed, reconnecting in {:?}",
                        poll_interval
                    );

                    if sleep_or_shutdown(poll_interval, &mut self.shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        info!(%slot_name, "consume loop stopped");

        Ok(())
    }

    /// Polls `stream` until shutdown or until it fails.
    async fn consume(&mut self, stream: &mut O::Stream) -> StreamExit {
        let poll_interval = self.config.poll_interval();

        loop {
            if is_shutdown_requested(&self.shutdown_rx) {
                return StreamExit::Shutdown;
            }

            let result = match stream.poll().await {
                Ok(result) => result,
                Err(err) => return StreamExit::Reconnect(err),
            };

            match result {
                PollResult::Changes { payload, cursor } => {
                    match self.handle_changes(stream, payload, cursor).await {
                        Ok(()) => {}
                        Err(err) if !err.kind().requires_reconnect() => {
                            warn!(
                                slot_name = %self.config.slot_name,
                                %cursor,
                                error = %err,
                                "skipping malformed change envelope"
                            );
                        }
                        Err(err) => return StreamExit::Reconnect(err),
                    }
                }
                PollResult::Keepalive { cursor } => {
                    debug!(slot_name = %self.config.slot_name, %cursor, "acknowledging keepalive");

                    if let Err(err) = stream.acknowledge(cursor).await {
                        return StreamExit::Reconnect(err);
                    }
                }
                PollResult::Empty => {
                    if sleep_or_shutdown(poll_interval, &mut self.shutdown_rx).await {
                        return StreamExit::Shutdown;
                    }
                }
            }
        }
    }

    /// Publishes the matching rows of the envelope at `cursor` and acknowledges it.
    ///
    /// The cursor is acknowledged only if every row was published, including when the envelope
    /// has no matching rows.
    async fn handle_changes(
        &self,
        stream: &mut O::Stream,
        payload: Bytes,
        cursor: PgLsn,
    ) -> CdcResult<()> {
        let config = &self.config;
        let envelope = Envelope::decode(&payload)?;
        let rows = envelope.extract_rows(&config.schema_name, &config.table_name)?;

        debug!(
            slot_name = %config.slot_name,
            %cursor,
            xid = envelope.xid,
            changes = envelope.changes.len(),
            rows = rows.len(),
            "received change envelope"
        );

        let mut all_published = true;
        for row in rows {
            // Only a skipped row is logged, so only then is it rendered.
            let rendered_row = matches!(config.publish_failure_policy, PublishFailurePolicy::Skip)
                .then(|| row.to_string());

            let Err(err) = self.sink.publish(row).await else {
                continue;
            };

            match config.publish_failure_policy {
                PublishFailurePolicy::Redeliver => {
                    return Err(cdc_error!(
                        ErrorKind::PublishFailed,
                        "Sink failed to publish row",
                        format!(
                            "Sink '{}' rejected a row of transaction {} at {cursor}, the transaction will be redelivered",
                            S::name(),
                            envelope.xid
                        ),
                        source: err
                    ));
                }
                PublishFailurePolicy::Skip => {
                    error!(
                        slot_name = %config.slot_name,
                        schema_name = %config.schema_name,
                        table_name = %config.table_name,
                        %cursor,
                        xid = envelope.xid,
                        row = rendered_row.as_deref().unwrap_or_default(),
                        error = %err,
                        "failed to publish row, the row is lost"
                    );
                    all_published = false;
                }
            }
        }

        if all_published {
            stream.acknowledge(cursor).await?;
        }

        Ok(())
    }
}
