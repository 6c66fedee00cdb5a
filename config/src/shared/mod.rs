mod base;
mod connection;
mod replication;
mod replicator;
mod sink;

pub use base::*;
pub use connection::*;
pub use replication::*;
pub use replicator::*;
pub use sink::*;
