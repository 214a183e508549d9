//! The per-partition processor: drives consumption from one partition across
//! the input topics, tracks every produced record as part of an in-flight
//! group, enforces in-flight backpressure, and decides when an input offset
//! may be marked as durably processed.
//!
//! All mutating operations are serialized by the owning
//! [PartitionWorker](crate::worker::PartitionWorker) task; nothing here locks.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::broker::{
    BrokerClient, Consumer, ListOffset, PartitionConsumer, PartitionOffsetManager, StartOffset,
};
use crate::config::{CommitMode, Settings};
use crate::error::{Error, Result};
use crate::inflight::InFlightMessageGroup;
use crate::message::{ConsumerRecord, DeliveryTag, IncomingMessage, ProducerRecord};
use crate::metrics::partition_metrics;
use crate::sender::{Coordinator, Sender};

/// User-supplied business logic, invoked once per input record.
///
/// The implementation may stage records through the [Sender] zero or more
/// times and may call [Coordinator::commit] at most once; neither handle may
/// be retained past the return.
pub trait MessageProcessor: Send {
    fn process(
        &mut self,
        message: &IncomingMessage,
        sender: &mut Sender,
        coordinator: &Coordinator<'_>,
    ) -> Result<()>;
}

/// State machine owning the consumers, offset managers and in-flight queues
/// of one partition.
pub struct PartitionProcessor<C, M>
where
    C: BrokerClient,
    M: MessageProcessor,
{
    partition: i32,
    settings: Arc<Settings>,
    consumer: C::Consumer,
    partition_consumers: Vec<<C::Consumer as Consumer>::PartitionConsumer>,
    // Record channels held until the worker takes them with
    // consumer_message_channels(); aligned with settings.input_topics.
    message_channels: Vec<mpsc::Receiver<Result<ConsumerRecord>>>,
    offset_managers: HashMap<String, C::PartitionOffsetManager>,
    in_flight_message_groups: HashMap<String, VecDeque<InFlightMessageGroup>>,
    commit_next_in_flight_message_group: Cell<bool>,
    message_processor: M,
    next_incoming_id: u64,
}

impl<C, M> PartitionProcessor<C, M>
where
    C: BrokerClient,
    M: MessageProcessor,
{
    /// Open the consumer, one offset manager and one partition consumer per
    /// input topic, and set up empty in-flight queues. A persisted next
    /// offset past the end of the log is clamped to newest, so a truncated
    /// or recreated topic resumes with catch-up instead of an out-of-range
    /// error. Any failure here is fatal for the worker.
    pub async fn new(
        client: &C,
        message_processor: M,
        partition: i32,
        settings: Arc<Settings>,
    ) -> Result<Self> {
        settings.validate()?;
        let mut consumer = client.new_consumer().await?;
        let mut partition_consumers = Vec::with_capacity(settings.input_topics.len());
        let mut message_channels = Vec::with_capacity(settings.input_topics.len());
        let mut offset_managers = HashMap::new();
        let mut in_flight_message_groups = HashMap::new();

        for topic in &settings.input_topics {
            let mut offset_manager = client.manage_partition(topic, partition).await?;
            let newest_offset = client
                .get_offset(topic, partition, ListOffset::Newest)
                .await?;
            let next_offset = offset_manager.next_offset().await?;
            let start_offset = if next_offset > newest_offset {
                info!(
                    topic,
                    partition, next_offset, newest_offset, "Persisted offset is past the end of the log, resuming from newest"
                );
                StartOffset::Newest
            } else {
                StartOffset::At(next_offset)
            };
            let (partition_consumer, records) = consumer
                .consume_partition(topic, partition, start_offset)
                .await?;
            debug!(topic, partition, ?start_offset, "Opened partition consumer");
            partition_consumers.push(partition_consumer);
            message_channels.push(records);
            offset_managers.insert(topic.clone(), offset_manager);
            in_flight_message_groups.insert(topic.clone(), VecDeque::new());
        }

        Ok(Self {
            partition,
            settings,
            consumer,
            partition_consumers,
            message_channels,
            offset_managers,
            in_flight_message_groups,
            commit_next_in_flight_message_group: Cell::new(false),
            message_processor,
            next_incoming_id: 0,
        })
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Hand out the per-topic record channels, aligned with the configured
    /// input topics, for the worker to fan in. An `Err` item reports a failed
    /// partition consumer and is followed by channel close. Subsequent calls
    /// return an empty list.
    pub fn consumer_message_channels(
        &mut self,
    ) -> Vec<(String, mpsc::Receiver<Result<ConsumerRecord>>)> {
        self.settings
            .input_topics
            .iter()
            .cloned()
            .zip(std::mem::take(&mut self.message_channels))
            .collect()
    }

    /// Run one input record through the user processor and enqueue the
    /// resulting in-flight group. Returns the staged records, in submission
    /// order, for the caller to dispatch.
    pub fn process(&mut self, record: ConsumerRecord) -> Result<Vec<ProducerRecord>> {
        let serde = self
            .settings
            .topic_serdes
            .get(&record.topic)
            .ok_or_else(|| Error::CodecMissing(record.topic.clone()))?;
        let key = serde.key.deserialize(&record.key)?;
        let value = serde.value.deserialize(&record.value)?;

        let id = self.next_incoming_id;
        self.next_incoming_id += 1;
        let incoming_message = Arc::new(IncomingMessage {
            topic: Arc::from(record.topic.as_str()),
            partition: record.partition,
            offset: record.offset,
            key,
            value,
            timestamp: record.timestamp,
            id,
        });

        let mut sender = Sender::new(
            Arc::clone(&self.settings.topic_serdes),
            Arc::clone(&incoming_message),
        );
        self.commit_next_in_flight_message_group.set(false);
        {
            let coordinator = Coordinator::new(&self.commit_next_in_flight_message_group);
            self.message_processor
                .process(&incoming_message, &mut sender, &coordinator)?;
        }
        let group = sender
            .create_in_flight_message_group(self.commit_next_in_flight_message_group.get());
        let producer_records: Vec<ProducerRecord> = group
            .in_flight_messages
            .iter()
            .map(|m| m.record.clone())
            .collect();

        let queue = self
            .in_flight_message_groups
            .get_mut(&record.topic)
            .ok_or_else(|| {
                Error::Processor(format!(
                    "Record from topic '{}' which is not an input topic",
                    record.topic
                ))
            })?;
        queue.push_back(group);
        Ok(producer_records)
    }

    /// Prune completed interior groups. The last group of a completed prefix
    /// is retained: only the offset-advancing scan may pop it, because that
    /// scan also records the durable offset. Intended to be called after the
    /// records returned by [process](Self::process) have been dispatched.
    pub fn on_process_completed(&mut self) {
        let settings = Arc::clone(&self.settings);
        for topic in &settings.input_topics {
            self.prune_in_flight_message_groups_for_topic(topic);
        }
    }

    fn prune_in_flight_message_groups_for_topic(&mut self, topic: &str) {
        let Some(queue) = self.in_flight_message_groups.get_mut(topic) else {
            return;
        };
        while queue.len() > 1 {
            if !queue[0].all_acks_are_true() || !queue[1].all_acks_are_true() {
                break;
            }
            queue.pop_front();
        }
    }

    /// Per-topic backpressure check for the candidate record. When this
    /// returns false the caller must block on ack arrival or shutdown, not on
    /// more input. The bound is soft: the check uses `<=`, so the queue can
    /// hold `max + 1` groups before the first false is observed.
    pub fn is_ready_for_message(&self, record: &ConsumerRecord) -> bool {
        let queued = self
            .in_flight_message_groups
            .get(&record.topic)
            .map_or(0, VecDeque::len);
        queued <= self.settings.max_in_flight_message_groups
    }

    /// Apply one broker acknowledgement. Failure to locate the group or the
    /// record inside it means the in-flight bookkeeping no longer matches
    /// what was dispatched, and the worker must die rather than risk marking
    /// an offset whose records were never delivered.
    pub fn on_producer_ack(&mut self, tag: &DeliveryTag) -> Result<()> {
        let queue = self
            .in_flight_message_groups
            .get_mut(tag.source_topic.as_ref())
            .ok_or_else(|| {
                Error::Ack(format!(
                    "No in-flight queue for topic '{}'",
                    tag.source_topic
                ))
            })?;
        let group = queue
            .iter_mut()
            .find(|group| group.incoming_message.id == tag.incoming_id)
            .ok_or_else(|| Error::Ack(format!("Could not find in-flight group for {tag:?}")))?;
        let in_flight_message = group
            .in_flight_messages
            .iter_mut()
            .find(|m| m.record.tag.producer_id == tag.producer_id)
            .ok_or_else(|| Error::Ack(format!("Could not find produced record for {tag:?}")))?;
        in_flight_message.ack = true;
        Ok(())
    }

    /// Advance durable offsets: for each topic, pop the completed prefix and
    /// mark one past the offset of the last popped group (automatic mode), or
    /// mark as each committed group is popped (manual mode). Intended to be
    /// called after any ack arrives.
    pub async fn mark_offsets_if_possible(&mut self) -> Result<()> {
        let settings = Arc::clone(&self.settings);
        for topic in &settings.input_topics {
            self.mark_offsets_for_topic_if_possible(topic).await?;
        }
        Ok(())
    }

    async fn mark_offsets_for_topic_if_possible(&mut self, topic: &str) -> Result<()> {
        let labels = vec![
            ("topic".to_string(), topic.to_string()),
            ("partition".to_string(), self.partition.to_string()),
        ];
        let mut offset: i64 = -1;
        let Some(queue) = self.in_flight_message_groups.get_mut(topic) else {
            return Ok(());
        };
        loop {
            let Some(head) = queue.front() else { break };
            if !head.all_acks_are_true() {
                break;
            }
            let committed = head.committed;
            offset = head.incoming_message.offset;
            queue.pop_front();
            if committed && self.settings.commit_mode == CommitMode::Manual {
                let offset_manager = self.offset_managers.get_mut(topic).ok_or_else(|| {
                    Error::OffsetManager(format!("No offset manager for topic '{topic}'"))
                })?;
                offset_manager.mark_offset(offset + 1, "").await?;
                partition_metrics()
                    .offsets_marked_total
                    .get_or_create(&labels)
                    .inc();
            }
        }
        if offset != -1 && self.settings.commit_mode == CommitMode::Automatic {
            let offset_manager = self.offset_managers.get_mut(topic).ok_or_else(|| {
                Error::OffsetManager(format!("No offset manager for topic '{topic}'"))
            })?;
            offset_manager.mark_offset(offset + 1, "").await?;
            partition_metrics()
                .offsets_marked_total
                .get_or_create(&labels)
                .inc();
        }
        Ok(())
    }

    /// Total in-flight groups across all input topics.
    pub fn total_in_flight_groups(&self) -> usize {
        self.in_flight_message_groups.values().map(VecDeque::len).sum()
    }

    /// Close everything this processor opened. Offset managers go first so
    /// pending marks can flush before the consumers driving them are torn
    /// down.
    pub async fn on_shutdown(&mut self) -> Result<()> {
        let settings = Arc::clone(&self.settings);
        for topic in &settings.input_topics {
            if let Some(offset_manager) = self.offset_managers.get_mut(topic) {
                offset_manager.close().await?;
            }
        }
        for partition_consumer in &mut self.partition_consumers {
            partition_consumer.close().await?;
        }
        self.consumer.close().await
    }
}
