use bytes::Bytes;
use tokio_postgres::types::PgLsn;

/// Outcome of a single non-blocking poll of a replication stream.
///
/// Exactly one variant is produced per poll. The cursor carried by [`PollResult::Changes`] and
/// [`PollResult::Keepalive`] is the position the stream had reached after the read and is the
/// value to pass to [`crate::replication::stream::ReplicationStream::acknowledge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    /// A change envelope was received at `cursor`.
    Changes { payload: Bytes, cursor: PgLsn },
    /// No payload was received, but the source advanced the position to `cursor`.
    Keepalive { cursor: PgLsn },
    /// Nothing was received and the position did not move.
    Empty,
}
