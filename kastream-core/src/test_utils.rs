//! In-memory broker, producer and message-processor doubles shared by the
//! processor and worker tests. The broker keeps per-partition logs behind a
//! mutex and records lifecycle events so tests can assert on close ordering
//! and offset marks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::broker::{
    BrokerClient, Consumer, DeliveryHandle, ListOffset, PartitionConsumer,
    PartitionOffsetManager, Producer, StartOffset,
};
use crate::codec::{StringSerde, TopicSerde, TopicSerdes};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::message::{ConsumerRecord, DeliveryTag, IncomingMessage, ProducerMessage, ProducerRecord};
use crate::processor::MessageProcessor;
use crate::sender::{Coordinator, Sender};

pub(crate) fn test_settings(input_topics: &[&str], output_topics: &[&str]) -> Settings {
    let mut serdes = TopicSerdes::new();
    for topic in input_topics.iter().chain(output_topics.iter()) {
        serdes.insert(topic.to_string(), TopicSerde::new(StringSerde, StringSerde));
    }
    Settings {
        input_topics: input_topics.iter().map(|t| t.to_string()).collect(),
        topic_serdes: Arc::new(serdes),
        auto_mark_interval: Duration::from_millis(50),
        shutdown_grace: Duration::from_millis(200),
        ..Default::default()
    }
}

pub(crate) async fn wait_for(description: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {description}"));
}

struct Tap {
    sender: mpsc::Sender<Result<ConsumerRecord>>,
    start: i64,
}

#[derive(Default)]
struct PartitionLog {
    records: Vec<ConsumerRecord>,
    log_end: i64,
    committed: Option<i64>,
    marked: Vec<i64>,
    taps: Vec<Tap>,
}

#[derive(Default)]
struct BrokerState {
    logs: HashMap<(String, i32), PartitionLog>,
    events: Vec<String>,
}

/// Test-side handle on the shared broker state.
#[derive(Clone, Default)]
pub(crate) struct TestBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl TestBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn client(&self) -> TestClient {
        TestClient {
            state: Arc::clone(&self.state),
        }
    }

    /// Position the log end without materializing records, as if earlier
    /// records had been truncated away.
    pub(crate) fn set_log_end(&self, topic: &str, partition: i32, offset: i64) {
        let mut state = self.state.lock();
        state
            .logs
            .entry((topic.to_string(), partition))
            .or_default()
            .log_end = offset;
    }

    pub(crate) fn set_committed(&self, topic: &str, partition: i32, next_offset: i64) {
        let mut state = self.state.lock();
        state
            .logs
            .entry((topic.to_string(), partition))
            .or_default()
            .committed = Some(next_offset);
    }

    /// Append a record at the next offset and deliver it to any live
    /// partition consumers.
    pub(crate) fn push_record(
        &self,
        topic: &str,
        partition: i32,
        key: &str,
        value: &str,
    ) -> ConsumerRecord {
        let mut state = self.state.lock();
        let log = state
            .logs
            .entry((topic.to_string(), partition))
            .or_default();
        let record = ConsumerRecord {
            topic: topic.to_string(),
            partition,
            offset: log.log_end,
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
            timestamp: Utc::now(),
        };
        log.log_end += 1;
        log.records.push(record.clone());
        for tap in &log.taps {
            if record.offset >= tap.start {
                let _ = tap.sender.try_send(Ok(record.clone()));
            }
        }
        record
    }

    /// Report a failed partition consumer: every live tap receives a terminal
    /// error and its channel closes.
    pub(crate) fn fail_partition(&self, topic: &str, partition: i32, message: &str) {
        let mut state = self.state.lock();
        let log = state
            .logs
            .entry((topic.to_string(), partition))
            .or_default();
        for tap in log.taps.drain(..) {
            let _ = tap.sender.try_send(Err(Error::Broker(message.to_string())));
        }
    }

    /// Offsets passed to `mark_offset` for this partition, in call order.
    pub(crate) fn marked(&self, topic: &str, partition: i32) -> Vec<i64> {
        self.state
            .lock()
            .logs
            .get(&(topic.to_string(), partition))
            .map(|log| log.marked.clone())
            .unwrap_or_default()
    }

    pub(crate) fn events(&self) -> Vec<String> {
        self.state.lock().events.clone()
    }
}

#[derive(Clone)]
pub(crate) struct TestClient {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl BrokerClient for TestClient {
    type Consumer = TestConsumer;
    type PartitionOffsetManager = TestPartitionOffsetManager;

    async fn new_consumer(&self) -> Result<TestConsumer> {
        Ok(TestConsumer {
            state: Arc::clone(&self.state),
        })
    }

    async fn manage_partition(
        &self,
        topic: &str,
        partition: i32,
    ) -> Result<TestPartitionOffsetManager> {
        Ok(TestPartitionOffsetManager {
            state: Arc::clone(&self.state),
            topic: topic.to_string(),
            partition,
        })
    }

    async fn get_offset(&self, topic: &str, partition: i32, at: ListOffset) -> Result<i64> {
        let state = self.state.lock();
        let Some(log) = state.logs.get(&(topic.to_string(), partition)) else {
            return Ok(0);
        };
        Ok(match at {
            ListOffset::Newest => log.log_end,
            ListOffset::Oldest => log.records.first().map_or(log.log_end, |r| r.offset),
        })
    }
}

pub(crate) struct TestConsumer {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Consumer for TestConsumer {
    type PartitionConsumer = TestPartitionConsumer;

    async fn consume_partition(
        &mut self,
        topic: &str,
        partition: i32,
        start_offset: StartOffset,
    ) -> Result<(TestPartitionConsumer, mpsc::Receiver<Result<ConsumerRecord>>)> {
        let (tx, rx) = mpsc::channel(1024);
        let mut state = self.state.lock();
        state
            .events
            .push(format!("consume:{topic}:{partition}@{start_offset:?}"));
        let log = state
            .logs
            .entry((topic.to_string(), partition))
            .or_default();
        let start = match start_offset {
            StartOffset::At(offset) => offset,
            StartOffset::Newest => log.log_end,
        };
        for record in &log.records {
            if record.offset >= start {
                let _ = tx.try_send(Ok(record.clone()));
            }
        }
        log.taps.push(Tap { sender: tx, start });
        Ok((
            TestPartitionConsumer {
                state: Arc::clone(&self.state),
                topic: topic.to_string(),
            },
            rx,
        ))
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().events.push("close:consumer".to_string());
        Ok(())
    }
}

pub(crate) struct TestPartitionConsumer {
    state: Arc<Mutex<BrokerState>>,
    topic: String,
}

#[async_trait]
impl PartitionConsumer for TestPartitionConsumer {
    async fn close(&mut self) -> Result<()> {
        self.state
            .lock()
            .events
            .push(format!("close:partition_consumer:{}", self.topic));
        Ok(())
    }
}

pub(crate) struct TestPartitionOffsetManager {
    state: Arc<Mutex<BrokerState>>,
    topic: String,
    partition: i32,
}

#[async_trait]
impl PartitionOffsetManager for TestPartitionOffsetManager {
    async fn next_offset(&mut self) -> Result<i64> {
        let state = self.state.lock();
        Ok(state
            .logs
            .get(&(self.topic.clone(), self.partition))
            .and_then(|log| log.committed)
            .unwrap_or(0))
    }

    async fn mark_offset(&mut self, offset: i64, _metadata: &str) -> Result<()> {
        let mut state = self.state.lock();
        let log = state
            .logs
            .entry((self.topic.clone(), self.partition))
            .or_default();
        log.marked.push(offset);
        log.committed = Some(offset);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state
            .lock()
            .events
            .push(format!("close:offset_manager:{}", self.topic));
        Ok(())
    }
}

/// A dispatch captured by the manual [TestProducer], acked at the test's
/// discretion.
pub(crate) struct PendingDelivery {
    pub(crate) record: ProducerRecord,
    pub(crate) respond_to: oneshot::Sender<Result<DeliveryTag>>,
}

impl PendingDelivery {
    pub(crate) fn ack(self) {
        let tag = self.record.tag.clone();
        let _ = self.respond_to.send(Ok(tag));
    }
}

#[derive(Clone)]
pub(crate) struct TestProducer {
    pending: Option<mpsc::UnboundedSender<PendingDelivery>>,
}

impl TestProducer {
    /// Acknowledge every record as soon as it is sent.
    pub(crate) fn auto_ack() -> Self {
        Self { pending: None }
    }

    /// Capture dispatches and let the test decide the ack order.
    pub(crate) fn manual() -> (Self, mpsc::UnboundedReceiver<PendingDelivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { pending: Some(tx) }, rx)
    }
}

#[async_trait]
impl Producer for TestProducer {
    async fn send(&self, record: ProducerRecord) -> Result<DeliveryHandle> {
        let (tx, rx) = oneshot::channel();
        match &self.pending {
            None => {
                let tag = record.tag.clone();
                let _ = tx.send(Ok(tag));
            }
            Some(pending) => {
                pending
                    .send(PendingDelivery {
                        record,
                        respond_to: tx,
                    })
                    .map_err(|_| Error::Producer("Test producer receiver dropped".into()))?;
            }
        }
        Ok(rx)
    }
}

/// Emits one record per input, echoing key and value.
pub(crate) struct Echo {
    out_topic: String,
}

impl Echo {
    pub(crate) fn new(out_topic: &str) -> Self {
        Self {
            out_topic: out_topic.to_string(),
        }
    }
}

impl MessageProcessor for Echo {
    fn process(
        &mut self,
        message: &IncomingMessage,
        sender: &mut Sender,
        _coordinator: &Coordinator<'_>,
    ) -> Result<()> {
        let key = message.key_as::<String>().cloned().unwrap_or_default();
        let value = message.value_as::<String>().cloned().unwrap_or_default();
        sender.send(ProducerMessage::new(self.out_topic.clone(), key, value))
    }
}

/// Emits a fixed number of records per input.
pub(crate) struct FanOut {
    out_topic: String,
    copies: usize,
}

impl FanOut {
    pub(crate) fn new(out_topic: &str, copies: usize) -> Self {
        Self {
            out_topic: out_topic.to_string(),
            copies,
        }
    }
}

impl MessageProcessor for FanOut {
    fn process(
        &mut self,
        message: &IncomingMessage,
        sender: &mut Sender,
        _coordinator: &Coordinator<'_>,
    ) -> Result<()> {
        let key = message.key_as::<String>().cloned().unwrap_or_default();
        let value = message.value_as::<String>().cloned().unwrap_or_default();
        for i in 0..self.copies {
            sender.send(ProducerMessage::new(
                self.out_topic.clone(),
                key.clone(),
                format!("{value}-{i}"),
            ))?;
        }
        Ok(())
    }
}

/// Emits nothing; its groups are complete from birth.
pub(crate) struct Silent;

impl MessageProcessor for Silent {
    fn process(
        &mut self,
        _message: &IncomingMessage,
        _sender: &mut Sender,
        _coordinator: &Coordinator<'_>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Emits one record per input and requests a commit for one specific offset.
pub(crate) struct CommitAt {
    out_topic: String,
    commit_offset: i64,
}

impl CommitAt {
    pub(crate) fn new(out_topic: &str, commit_offset: i64) -> Self {
        Self {
            out_topic: out_topic.to_string(),
            commit_offset,
        }
    }
}

impl MessageProcessor for CommitAt {
    fn process(
        &mut self,
        message: &IncomingMessage,
        sender: &mut Sender,
        coordinator: &Coordinator<'_>,
    ) -> Result<()> {
        if message.offset == self.commit_offset {
            coordinator.commit();
        }
        let key = message.key_as::<String>().cloned().unwrap_or_default();
        let value = message.value_as::<String>().cloned().unwrap_or_default();
        sender.send(ProducerMessage::new(self.out_topic.clone(), key, value))
    }
}
