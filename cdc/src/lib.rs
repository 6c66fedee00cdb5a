//! Change data capture from a Postgres logical replication slot decoded with wal2json.
//!
//! A [`pipeline::Pipeline`] runs a consumer worker that polls a
//! [`replication::stream::ReplicationStream`], extracts the rows inserted into one table with
//! [`envelope::Envelope`] and publishes them to a [`sink::Sink`]. A change is acknowledged to
//! the source only after all of its rows were published.

pub mod concurrency;
pub mod envelope;
pub mod error;
mod macros;
pub mod pipeline;
pub mod replication;
pub mod sink;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
