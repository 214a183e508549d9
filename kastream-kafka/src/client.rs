use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer as RdKafkaConsumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::Offset;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use kastream_core::broker::{
    BrokerClient, Consumer, ListOffset, PartitionConsumer, PartitionOffsetManager, StartOffset,
};
use kastream_core::message::ConsumerRecord;

use crate::{Error, KafkaConfig, Result};

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const RECORD_CHANNEL_CAPACITY: usize = 500;
// A run of this many consecutive read failures is terminal for the
// partition; a successful read resets the count.
const MAX_FAILURE_COUNT: usize = 10;

/// Entry point to the broker: owns a group-aware consumer used for watermark
/// and committed-offset queries, and hands out per-partition consumers and
/// offset managers.
pub struct KafkaClient {
    config: KafkaConfig,
    metadata_consumer: Arc<BaseConsumer>,
}

impl KafkaClient {
    pub fn new(config: KafkaConfig) -> Result<Self> {
        let metadata_consumer: BaseConsumer =
            config
                .consumer_client_config()?
                .create()
                .map_err(|err| Error::Connection {
                    server: config.brokers.join(","),
                    error: err.to_string(),
                })?;
        Ok(Self {
            config,
            metadata_consumer: Arc::new(metadata_consumer),
        })
    }
}

#[async_trait]
impl BrokerClient for KafkaClient {
    type Consumer = KafkaConsumer;
    type PartitionOffsetManager = KafkaPartitionOffsetManager;

    async fn new_consumer(&self) -> kastream_core::Result<KafkaConsumer> {
        Ok(KafkaConsumer {
            config: self.config.clone(),
        })
    }

    async fn manage_partition(
        &self,
        topic: &str,
        partition: i32,
    ) -> kastream_core::Result<KafkaPartitionOffsetManager> {
        Ok(KafkaPartitionOffsetManager {
            consumer: Arc::clone(&self.metadata_consumer),
            topic: topic.to_string(),
            partition,
            last_marked: None,
        })
    }

    async fn get_offset(
        &self,
        topic: &str,
        partition: i32,
        at: ListOffset,
    ) -> kastream_core::Result<i64> {
        let (low, high) = self
            .metadata_consumer
            .fetch_watermarks(topic, partition, METADATA_TIMEOUT)
            .map_err(|e| Error::Kafka(format!("Failed to fetch watermarks: {e}")))?;
        Ok(match at {
            ListOffset::Newest => high,
            ListOffset::Oldest => low,
        })
    }
}

/// Opens per-partition stream consumers. Each partition consumer owns its
/// connection, so there is nothing shared to tear down here.
pub struct KafkaConsumer {
    config: KafkaConfig,
}

#[async_trait]
impl Consumer for KafkaConsumer {
    type PartitionConsumer = KafkaPartitionConsumer;

    async fn consume_partition(
        &mut self,
        topic: &str,
        partition: i32,
        start_offset: StartOffset,
    ) -> kastream_core::Result<(
        KafkaPartitionConsumer,
        mpsc::Receiver<kastream_core::Result<ConsumerRecord>>,
    )> {
        let consumer: StreamConsumer =
            self.config
                .consumer_client_config()?
                .create()
                .map_err(|err| Error::Connection {
                    server: self.config.brokers.join(","),
                    error: err.to_string(),
                })?;
        let offset = match start_offset {
            StartOffset::At(offset) => Offset::Offset(offset),
            StartOffset::Newest => Offset::End,
        };
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, offset)
            .map_err(|e| Error::Kafka(format!("Failed to add partition offset: {e}")))?;
        consumer
            .assign(&tpl)
            .map_err(|e| Error::Kafka(format!("Failed to assign partition: {e}")))?;

        let (tx, rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
        let cancel_token = CancellationToken::new();
        let task_token = cancel_token.clone();
        let task_topic = topic.to_string();
        let join_handle = tokio::spawn(async move {
            debug!(topic = task_topic, partition, "Starting partition fetch loop");
            let mut continuous_failure_count = 0;
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    message = consumer.recv() => {
                        let message = match message {
                            Ok(message) => {
                                continuous_failure_count = 0;
                                message
                            }
                            Err(e) => {
                                continuous_failure_count += 1;
                                if continuous_failure_count > MAX_FAILURE_COUNT {
                                    error!(?e, topic = task_topic, partition, "Giving up reading from partition");
                                    let _ = tx
                                        .send(Err(Error::Kafka(format!(
                                            "Failed to read from partition {task_topic}:{partition} after {MAX_FAILURE_COUNT} retries: {e:?}"
                                        ))
                                        .into()))
                                        .await;
                                    break;
                                }
                                error!(?e, topic = task_topic, partition, "Failed to read from partition, will retry after 100 milliseconds");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                continue;
                            }
                        };
                        let record = ConsumerRecord {
                            topic: message.topic().to_string(),
                            partition: message.partition(),
                            offset: message.offset(),
                            key: message.key().map(Bytes::copy_from_slice).unwrap_or_default(),
                            value: message.payload().map(Bytes::copy_from_slice).unwrap_or_default(),
                            timestamp: message
                                .timestamp()
                                .to_millis()
                                .and_then(DateTime::from_timestamp_millis)
                                .unwrap_or_else(Utc::now),
                        };
                        if tx.send(Ok(record)).await.is_err() {
                            // receiver side is gone
                            break;
                        }
                    }
                }
            }
        });

        Ok((
            KafkaPartitionConsumer {
                cancel_token,
                join_handle: Some(join_handle),
            },
            rx,
        ))
    }

    async fn close(&mut self) -> kastream_core::Result<()> {
        Ok(())
    }
}

/// Handle on one partition's fetch loop; closing stops the loop and its
/// connection.
pub struct KafkaPartitionConsumer {
    cancel_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl PartitionConsumer for KafkaPartitionConsumer {
    async fn close(&mut self) -> kastream_core::Result<()> {
        self.cancel_token.cancel();
        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|e| Error::Other(format!("Partition fetch task panicked: {e}")))?;
        }
        Ok(())
    }
}

/// Committed-offset store for one `(topic, partition)`, backed by the
/// consumer group's offsets. Marks are committed asynchronously; close
/// re-commits the last mark synchronously so nothing pending is lost.
pub struct KafkaPartitionOffsetManager {
    consumer: Arc<BaseConsumer>,
    topic: String,
    partition: i32,
    last_marked: Option<i64>,
}

impl KafkaPartitionOffsetManager {
    fn partition_list(&self, offset: i64) -> Result<TopicPartitionList> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.partition, Offset::Offset(offset))
            .map_err(|e| Error::Kafka(format!("Failed to add partition offset: {e}")))?;
        Ok(tpl)
    }
}

#[async_trait]
impl PartitionOffsetManager for KafkaPartitionOffsetManager {
    async fn next_offset(&mut self) -> kastream_core::Result<i64> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&self.topic, self.partition);
        let committed = self
            .consumer
            .committed_offsets(tpl, METADATA_TIMEOUT)
            .map_err(|e| Error::Kafka(format!("Failed to get committed offsets: {e}")))?;
        if let Some(Offset::Offset(offset)) = committed
            .elements_for_topic(&self.topic)
            .first()
            .map(|element| element.offset())
        {
            return Ok(offset);
        }
        // nothing committed yet for this group: start from the oldest record
        let (low, _) = self
            .consumer
            .fetch_watermarks(&self.topic, self.partition, METADATA_TIMEOUT)
            .map_err(|e| Error::Kafka(format!("Failed to fetch watermarks: {e}")))?;
        Ok(low)
    }

    // Commit metadata is accepted for interface compatibility but not
    // transmitted; librdkafka's commit API has no per-offset metadata hook.
    async fn mark_offset(&mut self, offset: i64, _metadata: &str) -> kastream_core::Result<()> {
        let tpl = self.partition_list(offset)?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| Error::Kafka(format!("Failed to commit offset: {e}")))?;
        self.last_marked = Some(offset);
        Ok(())
    }

    async fn close(&mut self) -> kastream_core::Result<()> {
        if let Some(offset) = self.last_marked.take() {
            let tpl = self.partition_list(offset)?;
            self.consumer
                .commit(&tpl, CommitMode::Sync)
                .map_err(|e| Error::Kafka(format!("Failed to flush committed offset: {e}")))?;
        }
        Ok(())
    }
}
