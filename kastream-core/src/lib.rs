//! Per-partition stream processing core. A [PartitionWorker] owns one
//! partition of a set of input topics and executes the cycle: read a record,
//! run the user [MessageProcessor] over it, dispatch the records it staged,
//! and mark the input offset as durably processed only once the broker has
//! acknowledged every record derived from it (and from every earlier record
//! on that topic). A crash between dispatch and mark replays from the last
//! marked offset, giving at-least-once delivery.
//!
//! The broker is reached only through the narrow traits in [broker]; the
//! `kastream-kafka` crate provides the rdkafka-backed implementation.

pub mod broker;
pub mod codec;
pub mod config;
mod error;
mod inflight;
pub mod message;
pub mod metrics;
pub mod processor;
pub mod sender;
pub mod setup_tracing;
pub mod worker;

#[cfg(test)]
mod test_utils;

pub use crate::config::{CommitMode, Settings};
pub use crate::error::{Error, Result};
pub use crate::message::{
    ConsumerRecord, DeliveryTag, IncomingMessage, ProducerMessage, ProducerRecord,
};
pub use crate::processor::{MessageProcessor, PartitionProcessor};
pub use crate::sender::{Coordinator, Sender};
pub use crate::worker::PartitionWorker;
