//! Logical replication from a Postgres slot decoded with wal2json.
//!
//! [`client`] speaks the replication protocol, [`stream`] turns it into non-blocking polls with
//! an acknowledgment cursor and [`consume`] drives a stream until shutdown.

pub mod client;
pub mod consume;
pub mod stream;
