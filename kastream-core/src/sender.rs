//! Per-input-record staging. A fresh [Sender] is created before every call
//! into user code; records staged through it are serialized immediately, so
//! the copy dispatched to the broker and the copy retained in the in-flight
//! group share the same bytes. The [Coordinator] is the capability user code
//! uses to request a durable commit for the record being processed.

use std::cell::Cell;
use std::sync::Arc;

use crate::codec::TopicSerdes;
use crate::error::{Error, Result};
use crate::inflight::{InFlightMessage, InFlightMessageGroup};
use crate::message::{DeliveryTag, IncomingMessage, ProducerMessage, ProducerRecord};

/// Staging buffer for the records produced from one input record. Makes no
/// broker calls itself.
pub struct Sender {
    serdes: Arc<TopicSerdes>,
    incoming_message: Arc<IncomingMessage>,
    producer_records: Vec<ProducerRecord>,
}

impl Sender {
    pub(crate) fn new(serdes: Arc<TopicSerdes>, incoming_message: Arc<IncomingMessage>) -> Self {
        Self {
            serdes,
            incoming_message,
            producer_records: Vec::new(),
        }
    }

    /// Stage one record for production. The record is serialized with its
    /// topic's codec and tagged with the identity of the originating input
    /// record, so the broker's ack can be routed back to it.
    pub fn send(&mut self, message: ProducerMessage) -> Result<()> {
        let serde = self
            .serdes
            .get(&message.topic)
            .ok_or_else(|| Error::CodecMissing(message.topic.clone()))?;
        let key = serde.key.serialize(message.key.as_ref())?;
        let value = serde.value.serialize(message.value.as_ref())?;
        let tag = DeliveryTag {
            source_topic: Arc::clone(&self.incoming_message.topic),
            incoming_id: self.incoming_message.id,
            producer_id: self.producer_records.len() as u64,
        };
        self.producer_records.push(ProducerRecord {
            topic: message.topic,
            key,
            value,
            tag,
        });
        Ok(())
    }

    /// Freeze the staged records into an in-flight group, none of them acked
    /// yet. `committed` carries the user's commit request for this record.
    pub(crate) fn create_in_flight_message_group(self, committed: bool) -> InFlightMessageGroup {
        InFlightMessageGroup {
            incoming_message: self.incoming_message,
            in_flight_messages: self
                .producer_records
                .into_iter()
                .map(|record| InFlightMessage { record, ack: false })
                .collect(),
            committed,
        }
    }
}

/// Capability handed to user code alongside the [Sender]. Calling
/// [commit](Coordinator::commit) requests that the offset of the record
/// currently being processed be durably marked once its group completes;
/// it only has an effect when the processor runs with manual commits.
pub struct Coordinator<'a> {
    commit: &'a Cell<bool>,
}

impl<'a> Coordinator<'a> {
    pub(crate) fn new(commit: &'a Cell<bool>) -> Self {
        Self { commit }
    }

    pub fn commit(&self) {
        self.commit.set(true);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::Utc;

    use super::*;
    use crate::codec::{StringSerde, TopicSerde};

    fn serdes() -> Arc<TopicSerdes> {
        let mut serdes = TopicSerdes::new();
        serdes.insert("out".to_string(), TopicSerde::new(StringSerde, StringSerde));
        Arc::new(serdes)
    }

    fn incoming(id: u64, offset: i64) -> Arc<IncomingMessage> {
        Arc::new(IncomingMessage {
            topic: Arc::from("in"),
            partition: 0,
            offset,
            key: Box::new("k".to_string()),
            value: Box::new("v".to_string()),
            timestamp: Utc::now(),
            id,
        })
    }

    #[test]
    fn staged_records_keep_submission_order_and_tags() {
        let mut sender = Sender::new(serdes(), incoming(9, 42));
        sender
            .send(ProducerMessage::new(
                "out",
                "a".to_string(),
                "first".to_string(),
            ))
            .unwrap();
        sender
            .send(ProducerMessage::new(
                "out",
                "b".to_string(),
                "second".to_string(),
            ))
            .unwrap();

        let group = sender.create_in_flight_message_group(true);
        assert!(group.committed);
        assert_eq!(group.in_flight_messages.len(), 2);
        for (i, in_flight) in group.in_flight_messages.iter().enumerate() {
            assert!(!in_flight.ack);
            assert_eq!(in_flight.record.tag.incoming_id, 9);
            assert_eq!(in_flight.record.tag.producer_id, i as u64);
            assert_eq!(in_flight.record.tag.source_topic.as_ref(), "in");
        }
        assert_eq!(
            group.in_flight_messages[0].record.value,
            Bytes::from_static(b"first")
        );
    }

    #[test]
    fn send_to_unregistered_topic_fails() {
        let mut sender = Sender::new(serdes(), incoming(0, 0));
        let err = sender
            .send(ProducerMessage::new(
                "nowhere",
                "k".to_string(),
                "v".to_string(),
            ))
            .unwrap_err();
        assert!(matches!(err, Error::CodecMissing(topic) if topic == "nowhere"));
    }

    #[test]
    fn coordinator_raises_the_commit_flag() {
        let flag = Cell::new(false);
        let coordinator = Coordinator::new(&flag);
        assert!(!flag.get());
        coordinator.commit();
        assert!(flag.get());
    }
}
