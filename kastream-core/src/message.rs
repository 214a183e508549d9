//! Record types that flow through a partition worker. A raw [ConsumerRecord]
//! is read off the log, deserialized into an [IncomingMessage], handed to user
//! code, and the records staged in response are serialized into
//! [ProducerRecord]s before dispatch. Every produced record carries a
//! [DeliveryTag] that the broker producer returns verbatim with its ack, so
//! the ack path can find the exact in-flight entry it settles.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A deserialized user-domain key or value. Codecs produce and consume these;
/// the framework never looks inside.
pub type DomainValue = Box<dyn Any + Send + Sync>;

/// Raw record as read off a partition, before deserialization.
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Bytes,
    pub value: Bytes,
    pub timestamp: DateTime<Utc>,
}

/// One deserialized input record, as seen by the user message processor.
///
/// The `id` is a monotonic in-process identifier assigned at deserialization;
/// together with a per-group sequence number it stands in for the pointer
/// identity the ack path needs to locate this record's in-flight group.
pub struct IncomingMessage {
    pub topic: Arc<str>,
    pub partition: i32,
    pub offset: i64,
    pub key: DomainValue,
    pub value: DomainValue,
    pub timestamp: DateTime<Utc>,
    pub(crate) id: u64,
}

impl IncomingMessage {
    /// Downcast the deserialized key to its concrete type.
    pub fn key_as<T: 'static>(&self) -> Option<&T> {
        self.key.downcast_ref()
    }

    /// Downcast the deserialized value to its concrete type.
    pub fn value_as<T: 'static>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }
}

impl fmt::Debug for IncomingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingMessage")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("timestamp", &self.timestamp)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// A record staged by user code through the [Sender](crate::Sender). The key
/// and value are domain types; the topic's codec serializes them at staging
/// time.
pub struct ProducerMessage {
    pub topic: String,
    pub key: DomainValue,
    pub value: DomainValue,
}

impl ProducerMessage {
    pub fn new(
        topic: impl Into<String>,
        key: impl Any + Send + Sync,
        value: impl Any + Send + Sync,
    ) -> Self {
        Self {
            topic: topic.into(),
            key: Box::new(key),
            value: Box::new(value),
        }
    }
}

impl fmt::Debug for ProducerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerMessage")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Serialized record handed to the broker producer. Cheap to clone; the
/// payloads are shared [Bytes].
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub topic: String,
    pub key: Bytes,
    pub value: Bytes,
    pub tag: DeliveryTag,
}

/// Identity of one produced record, attached at staging time and returned
/// verbatim by the producer with the broker's acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    /// Input topic of the originating record; selects the in-flight queue.
    pub source_topic: Arc<str>,
    /// In-process id of the originating incoming message.
    pub incoming_id: u64,
    /// Sequence number of this record within its in-flight group.
    pub producer_id: u64,
}
