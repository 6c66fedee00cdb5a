//! Downstream consumers of extracted rows.
//!
//! The consumer loop hands every row to a [`Sink`] and only acknowledges an envelope once all
//! of its rows were published. [`logging::LoggingSink`] and [`counting::CountingSink`] are
//! ready to use sinks, [`memory::MemorySink`] keeps rows for inspection.

mod base;
pub mod counting;
pub mod logging;
pub mod memory;

pub use base::Sink;
