//! Narrow interfaces over the broker client library. The core never talks to
//! a broker directly; it drives these traits, and `kastream-kafka` (or a test
//! fake) supplies the implementation.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::message::{ConsumerRecord, DeliveryTag, ProducerRecord};

/// Which end of a partition's log to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOffset {
    Newest,
    Oldest,
}

/// Where a partition consumer starts reading. `Newest` is the catch-up
/// sentinel used when the persisted offset is past the end of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    At(i64),
    Newest,
}

/// Resolves once the broker acknowledges the corresponding produced record.
/// The tag comes back verbatim from [Producer::send]; a produce failure
/// resolves to an error and terminates the worker.
pub type DeliveryHandle = oneshot::Receiver<Result<DeliveryTag>>;

#[async_trait]
pub trait BrokerClient: Send + Sync {
    type Consumer: Consumer;
    type PartitionOffsetManager: PartitionOffsetManager;

    async fn new_consumer(&self) -> Result<Self::Consumer>;

    /// Open the durable offset store for one `(topic, partition)`.
    async fn manage_partition(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<Self::PartitionOffsetManager>;

    /// Query the log's newest (end) or oldest offset for a partition.
    async fn get_offset(&self, topic: &str, partition: i32, at: ListOffset) -> Result<i64>;
}

#[async_trait]
pub trait Consumer: Send {
    type PartitionConsumer: PartitionConsumer;

    /// Open one `(topic, partition)` at the given offset. The returned
    /// receiver yields records in offset order and closes when the consumer
    /// is closed. An `Err` item is terminal: it reports a partition consumer
    /// that gave up (broker unreachable, partition gone) and is followed by
    /// channel close; the worker treats it as fatal.
    async fn consume_partition(
        &mut self,
        topic: &str,
        partition: i32,
        start_offset: StartOffset,
    ) -> Result<(Self::PartitionConsumer, mpsc::Receiver<Result<ConsumerRecord>>)>;

    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait PartitionConsumer: Send {
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait PartitionOffsetManager: Send {
    /// The persisted "next offset to read" for this partition.
    async fn next_offset(&mut self) -> Result<i64>;

    /// Persist `offset` as the next offset to read. Must be called with
    /// strictly increasing values.
    async fn mark_offset(&mut self, offset: i64, metadata: &str) -> Result<()>;

    /// Flush pending marks and release the store. Called before the consumers
    /// feeding this manager are torn down.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Queue one record for production. May suspend under producer
    /// backpressure; the broker's acknowledgement arrives later through the
    /// returned handle.
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryHandle>;
}
