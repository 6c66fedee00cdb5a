//! Coordination primitives shared by the pipeline and the consumer worker.
//!
//! The [`shutdown`] module carries the cooperative shutdown signal from the owner of a
//! [`crate::pipeline::Pipeline`] to its worker. The [`signal`] module holds the watch-channel
//! aliases it is built on.

pub mod shutdown;
pub mod signal;
