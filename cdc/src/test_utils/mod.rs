//! Utilities for driving the consumer without a database.
//!
//! [`stream::ScriptedOpener`] replays a script of open and poll outcomes and
//! [`sink::RecordingSink`] records published rows, both into a shared [`event::EventLog`] so
//! that tests can check the order in which rows were published and cursors acknowledged.

pub mod envelope;
pub mod event;
pub mod sink;
pub mod stream;
