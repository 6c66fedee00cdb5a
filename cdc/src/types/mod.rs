//! Common types used throughout the consumer.
//!
//! Re-exports the row handed to sinks, the outcome of a single poll and the Postgres LSN type
//! used as acknowledgment cursor.

mod poll;
mod row;

pub use poll::*;
pub use row::*;

// Re-exports.
pub use tokio_postgres::types::PgLsn;
