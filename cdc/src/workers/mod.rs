//! Background tasks running the consumer.

pub mod consumer;
