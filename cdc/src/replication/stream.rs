use bytes::Bytes;
use config::shared::{PgConnectionConfig, ReplicationConfig};
use futures::{FutureExt, Stream, StreamExt};
use pin_project_lite::pin_project;
use postgres_replication::ReplicationStream as PgCopyBothStream;
use postgres_replication::protocol::ReplicationMessage;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_postgres::types::PgLsn;
use tracing::{debug, error, info};

use crate::bail;
use crate::cdc_error;
use crate::error::{CdcResult, ErrorKind};
use crate::replication::client::{CreateSlotResult, PgReplicationClient};
use crate::types::PollResult;

/// Seconds between the Unix epoch and the Postgres epoch (2000-01-01 00:00:00 UTC).
const POSTGRES_EPOCH_OFFSET_SECONDS: u64 = 946_684_800;

/// Value of the `reply` flag of a keepalive asking for an immediate status update.
const REPLY_REQUESTED: u8 = 1;

/// A source of change envelopes with an acknowledgment cursor.
///
/// The consumer loop only talks to the source through this trait, which keeps it independent
/// from the wire protocol.
pub trait ReplicationStream: Send {
    /// Reads whatever the source has sent without waiting for more.
    ///
    /// Returns [`PollResult::Changes`] when an envelope was read, [`PollResult::Keepalive`] when
    /// only the position moved and [`PollResult::Empty`] otherwise.
    fn poll(&mut self) -> impl Future<Output = CdcResult<PollResult>> + Send;

    /// Marks every change up to `cursor` as delivered.
    ///
    /// The acknowledged position never moves backwards. Acknowledging an older cursor is a
    /// no-op.
    fn acknowledge(&mut self, cursor: PgLsn) -> impl Future<Output = CdcResult<()>> + Send;

    /// Releases the stream. Failures are logged and never returned. Idempotent.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens [`ReplicationStream`]s, once at startup and again after every failure.
pub trait ReplicationStreamOpener: Send + Sync {
    type Stream: ReplicationStream;

    /// Opens a new stream positioned at the last acknowledged cursor of the slot.
    fn open(&self) -> impl Future<Output = CdcResult<Self::Stream>> + Send;
}

/// Returns the current time as microseconds since the Postgres epoch.
fn postgres_timestamp() -> CdcResult<i64> {
    let postgres_epoch = UNIX_EPOCH + Duration::from_secs(POSTGRES_EPOCH_OFFSET_SECONDS);
    let elapsed = SystemTime::now()
        .duration_since(postgres_epoch)
        .map_err(|e| {
            cdc_error!(
                ErrorKind::InvalidState,
                "System clock is before the Postgres epoch",
                e
            )
        })?;

    Ok(elapsed.as_micros() as i64)
}

pin_project! {
    /// The copy-both stream of a replication connection, with standby status tracking.
    #[must_use = "streams do nothing unless polled"]
    pub struct ChangesStream {
        #[pin]
        stream: PgCopyBothStream,
        status_interval: Duration,
        last_update: Option<Instant>,
        last_flush_lsn: Option<PgLsn>,
        last_apply_lsn: Option<PgLsn>,
    }
}

impl ChangesStream {
    pub fn wrap(stream: PgCopyBothStream, status_interval: Duration) -> Self {
        Self {
            stream,
            status_interval,
            last_update: None,
            last_flush_lsn: None,
            last_apply_lsn: None,
        }
    }

    /// Sends a standby status update to the server.
    ///
    /// Unless `force` is set, the update is skipped when the flushed and applied positions did
    /// not change since the last update and the status interval has not elapsed yet. The
    /// received position alone never triggers an update.
    pub async fn send_status_update(
        self: Pin<&mut Self>,
        write_lsn: PgLsn,
        flush_lsn: PgLsn,
        apply_lsn: PgLsn,
        force: bool,
    ) -> CdcResult<()> {
        let this = self.project();

        if !force
            && let (Some(last_update), Some(last_flush), Some(last_apply)) = (
                this.last_update.as_ref(),
                this.last_flush_lsn.as_ref(),
                this.last_apply_lsn.as_ref(),
            )
            && flush_lsn == *last_flush
            && apply_lsn == *last_apply
            && last_update.elapsed() < *this.status_interval
        {
            return Ok(());
        }

        let ts = postgres_timestamp()?;
        this.stream
            .standby_status_update(write_lsn, flush_lsn, apply_lsn, ts, 0)
            .await?;

        debug!(%write_lsn, %flush_lsn, %apply_lsn, "status update successfully sent");

        *this.last_update = Some(Instant::now());
        *this.last_flush_lsn = Some(flush_lsn);
        *this.last_apply_lsn = Some(apply_lsn);

        Ok(())
    }
}

impl Stream for ChangesStream {
    type Item = CdcResult<ReplicationMessage<Bytes>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.stream.poll_next(cx) {
            Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Positions of a replication stream, both only ever moving forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamPositions {
    /// Highest position received from the server.
    received_lsn: PgLsn,
    /// Highest position acknowledged by the consumer.
    flushed_lsn: PgLsn,
}

impl StreamPositions {
    fn new() -> Self {
        Self {
            received_lsn: PgLsn::from(0),
            flushed_lsn: PgLsn::from(0),
        }
    }

    fn receive(&mut self, lsn: PgLsn) {
        if lsn > self.received_lsn {
            self.received_lsn = lsn;
        }
    }

    /// Records `cursor` as flushed. An older cursor leaves the positions unchanged.
    fn acknowledge(&mut self, cursor: PgLsn) {
        if cursor > self.flushed_lsn {
            self.flushed_lsn = cursor;
        }
        self.receive(self.flushed_lsn);
    }
}

/// Turns what a single poll read into a [`PollResult`].
///
/// A payload always wins. Without one, the received position before and after the read tells a
/// keepalive that moved the position apart from an empty read.
fn classify_read(
    received_before: PgLsn,
    received_after: PgLsn,
    payload: Option<(Bytes, PgLsn)>,
) -> PollResult {
    match payload {
        Some((payload, cursor)) => PollResult::Changes { payload, cursor },
        None if received_after > received_before => PollResult::Keepalive {
            cursor: received_after,
        },
        None => PollResult::Empty,
    }
}

/// Accepts the outcome of creating the slot, treating an existing slot as success.
fn ensure_slot_created(
    slot_name: &str,
    output_plugin: &str,
    created: CdcResult<CreateSlotResult>,
) -> CdcResult<()> {
    match created {
        Ok(slot) => {
            info!(
                slot_name,
                consistent_point = %slot.consistent_point,
                output_plugin,
                "created replication slot"
            );

            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::ReplicationSlotAlreadyExists => {
            info!(slot_name, "using existing replication slot");

            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// An open replication connection and its copy-both stream.
struct OpenStream {
    // Dropping the client terminates the connection, so it has to live as long as the stream.
    client: PgReplicationClient,
    stream: Pin<Box<ChangesStream>>,
}

/// [`ReplicationStream`] reading wal2json envelopes from a Postgres logical replication slot.
pub struct PgReplicationStream {
    slot_name: String,
    open: Option<OpenStream>,
    positions: StreamPositions,
}

impl PgReplicationStream {
    /// Connects to Postgres, creates the slot if missing and starts streaming from it.
    ///
    /// Replication resumes from the slot's confirmed flush position. Fails with
    /// [`ErrorKind::ReplicationSlotBusy`] if another process is streaming from the slot.
    pub async fn open(
        pg_connection: &PgConnectionConfig,
        replication: &ReplicationConfig,
    ) -> CdcResult<Self> {
        let slot_name = replication.slot_name.as_str();
        let client = PgReplicationClient::connect(pg_connection).await?;

        let created = client
            .create_slot(slot_name, &replication.output_plugin)
            .await;
        ensure_slot_created(slot_name, &replication.output_plugin, created)?;

        let stream = client
            .start_logical_replication(slot_name, PgLsn::from(0), &replication.slot_options)
            .await?;

        Ok(Self {
            slot_name: slot_name.to_string(),
            open: Some(OpenStream {
                client,
                stream: Box::pin(ChangesStream::wrap(stream, replication.status_interval())),
            }),
            positions: StreamPositions::new(),
        })
    }

    fn open_stream(&mut self) -> CdcResult<&mut OpenStream> {
        match self.open.as_mut() {
            Some(open) => Ok(open),
            None => Err(cdc_error!(
                ErrorKind::InvalidState,
                "Replication stream is closed",
                format!("Replication stream of slot '{}' was already closed", self.slot_name)
            )),
        }
    }

    async fn send_status_update(&mut self, force: bool) -> CdcResult<()> {
        let StreamPositions {
            received_lsn,
            flushed_lsn,
        } = self.positions;
        let open = self.open_stream()?;

        open.stream
            .as_mut()
            .send_status_update(received_lsn, flushed_lsn, flushed_lsn, force)
            .await
    }
}

impl ReplicationStream for PgReplicationStream {
    async fn poll(&mut self) -> CdcResult<PollResult> {
        let received_before = self.positions.received_lsn;
        let mut payload = None;

        loop {
            let open = self.open_stream()?;
            let Some(message) = open.stream.next().now_or_never() else {
                break;
            };

            match message {
                None => {
                    bail!(
                        ErrorKind::SourceConnectionFailed,
                        "Replication stream ended unexpectedly",
                        format!("The server closed the replication stream of slot '{}'", self.slot_name)
                    );
                }
                Some(Err(err)) => return Err(err),
                Some(Ok(ReplicationMessage::XLogData(body))) => {
                    let cursor = PgLsn::from(body.wal_start());
                    self.positions.receive(cursor);
                    payload = Some((body.into_data(), cursor));

                    break;
                }
                Some(Ok(ReplicationMessage::PrimaryKeepAlive(body))) => {
                    self.positions.receive(PgLsn::from(body.wal_end()));

                    if body.reply() == REPLY_REQUESTED {
                        self.send_status_update(true).await?;
                    }
                }
                Some(Ok(_)) => {}
            }
        }

        if payload.is_none() {
            // Keeps the connection alive while idle.
            self.send_status_update(false).await?;
        }

        Ok(classify_read(
            received_before,
            self.positions.received_lsn,
            payload,
        ))
    }

    async fn acknowledge(&mut self, cursor: PgLsn) -> CdcResult<()> {
        self.positions.acknowledge(cursor);

        self.send_status_update(false).await
    }

    async fn close(&mut self) {
        if self.open.is_none() {
            return;
        }

        if let Err(err) = self.send_status_update(true).await {
            error!(
                slot_name = %self.slot_name,
                flushed_lsn = %self.positions.flushed_lsn,
                error = %err,
                "failed to send final status update while closing replication stream"
            );
        }

        if let Some(OpenStream { client, stream }) = self.open.take() {
            drop(stream);

            if client.is_closed() {
                debug!(slot_name = %self.slot_name, "replication connection was already closed");
            }
        }

        info!(slot_name = %self.slot_name, "replication stream closed");
    }
}

/// Opens [`PgReplicationStream`]s for one slot.
#[derive(Debug, Clone)]
pub struct PgReplicationStreamOpener {
    pg_connection: PgConnectionConfig,
    replication: Arc<ReplicationConfig>,
}

impl PgReplicationStreamOpener {
    pub fn new(pg_connection: PgConnectionConfig, replication: Arc<ReplicationConfig>) -> Self {
        Self {
            pg_connection,
            replication,
        }
    }
}

impl ReplicationStreamOpener for PgReplicationStreamOpener {
    type Stream = PgReplicationStream;

    async fn open(&self) -> CdcResult<PgReplicationStream> {
        PgReplicationStream::open(&self.pg_connection, &self.replication).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lsn(value: u64) -> PgLsn {
        PgLsn::from(value)
    }

    #[test]
    fn test_postgres_timestamp_is_after_epoch() {
        let ts = postgres_timestamp().unwrap();

        // 2020-01-01 is 20 years after the Postgres epoch.
        assert!(ts > 20 * 365 * 24 * 3600 * 1_000_000);
    }

    #[test]
    fn test_payload_is_returned_as_changes_at_its_start() {
        let payload = Bytes::from_static(br#"{"xid":1,"change":[]}"#);

        let result = classify_read(lsn(10), lsn(40), Some((payload.clone(), lsn(40))));

        assert_eq!(
            result,
            PollResult::Changes {
                payload,
                cursor: lsn(40)
            }
        );
    }

    #[test]
    fn test_advanced_position_without_payload_is_keepalive() {
        assert_eq!(
            classify_read(lsn(10), lsn(25), None),
            PollResult::Keepalive { cursor: lsn(25) }
        );
    }

    #[test]
    fn test_unchanged_position_without_payload_is_empty() {
        assert_eq!(classify_read(lsn(10), lsn(10), None), PollResult::Empty);
    }

    #[test]
    fn test_received_position_never_moves_backwards() {
        let mut positions = StreamPositions::new();

        positions.receive(lsn(30));
        positions.receive(lsn(20));

        assert_eq!(positions.received_lsn, lsn(30));
    }

    #[test]
    fn test_acknowledging_older_cursor_is_a_no_op() {
        let mut positions = StreamPositions::new();
        positions.receive(lsn(100));

        positions.acknowledge(lsn(50));
        positions.acknowledge(lsn(20));

        assert_eq!(
            positions,
            StreamPositions {
                received_lsn: lsn(100),
                flushed_lsn: lsn(50),
            }
        );
    }

    #[test]
    fn test_acknowledging_ahead_of_received_moves_received() {
        let mut positions = StreamPositions::new();

        positions.acknowledge(lsn(70));

        assert_eq!(positions.received_lsn, lsn(70));
        assert_eq!(positions.flushed_lsn, lsn(70));
    }

    #[test]
    fn test_existing_slot_is_not_an_error() {
        let created = Ok(CreateSlotResult {
            consistent_point: lsn(8),
        });
        let existing = Err(cdc_error!(
            ErrorKind::ReplicationSlotAlreadyExists,
            "Replication slot already exists"
        ));

        assert!(ensure_slot_created("orders_slot", "wal2json", created).is_ok());
        assert!(ensure_slot_created("orders_slot", "wal2json", existing).is_ok());
    }

    #[test]
    fn test_other_slot_creation_errors_are_returned() {
        let busy = Err(cdc_error!(
            ErrorKind::ReplicationSlotBusy,
            "Replication slot is in use by another process"
        ));

        let err = ensure_slot_created("orders_slot", "wal2json", busy).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ReplicationSlotBusy);
    }
}
