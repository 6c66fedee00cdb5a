use std::future::Future;

use crate::error::CdcResult;
use crate::types::Row;

/// Receives the rows extracted from the replication slot.
///
/// Calls are sequential: the next row is only published after the previous call completed.
/// A returned error means the row was not delivered. Since envelopes are acknowledged only
/// after every row was published, a sink may see the same row again after a reconnect and
/// should tolerate duplicates.
pub trait Sink {
    /// Returns the name of the sink, used in logs.
    fn name() -> &'static str;

    /// Publishes a single row.
    fn publish(&self, row: Row) -> impl Future<Output = CdcResult<()>> + Send;
}
