//! Per-partition topology glue: fans the processor's input channels into one
//! selectable source, gates input on in-flight capacity, dispatches produced
//! records, and funnels produce acknowledgements back onto the partition task
//! so the processor's state is only ever touched from one place.

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use std::sync::Arc;

use crate::broker::{BrokerClient, DeliveryHandle, Producer};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::message::{ConsumerRecord, DeliveryTag};
use crate::metrics::partition_metrics;
use crate::processor::{MessageProcessor, PartitionProcessor};

type Delivery = std::result::Result<Result<DeliveryTag>, oneshot::error::RecvError>;

/// Owns one [PartitionProcessor] and drives its process→ack→advance cycle as
/// a single task. Parallelism exists across workers, never inside one.
pub struct PartitionWorker<C, M, P>
where
    C: BrokerClient,
    M: MessageProcessor,
    P: Producer,
{
    processor: PartitionProcessor<C, M>,
    producer: P,
    cancel_token: CancellationToken,
    common_labels: Vec<(String, String)>,
}

impl<C, M, P> PartitionWorker<C, M, P>
where
    C: BrokerClient,
    M: MessageProcessor,
    P: Producer,
{
    pub async fn new(
        client: &C,
        producer: P,
        message_processor: M,
        partition: i32,
        settings: Arc<Settings>,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        let processor =
            PartitionProcessor::new(client, message_processor, partition, settings).await?;
        let common_labels = vec![("partition".to_string(), partition.to_string())];
        Ok(Self {
            processor,
            producer,
            cancel_token,
            common_labels,
        })
    }

    /// Run until cancellation or until every input channel closes. On exit,
    /// drains pending produce acknowledgements for the configured grace
    /// period and then shuts the processor down.
    pub async fn run(mut self) -> Result<()> {
        let cancel_token = self.cancel_token.clone();
        let mut inputs = StreamMap::new();
        for (topic, records) in self.processor.consumer_message_channels() {
            inputs.insert(topic, ReceiverStream::new(records));
        }
        let mut pending_deliveries: FuturesUnordered<DeliveryHandle> = FuturesUnordered::new();
        let mut mark_interval =
            tokio::time::interval(self.processor.settings().auto_mark_interval);
        mark_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // At most one record pulled but not yet processed; it is held here
        // while its topic's in-flight queue is over capacity.
        let mut held: Option<ConsumerRecord> = None;
        // Terminal error reported by a partition consumer; surfaced after the
        // drain and shutdown steps have run.
        let mut input_failure: Option<Error> = None;

        info!(
            partition = self.processor.partition(),
            "Starting partition worker"
        );
        loop {
            if let Some(record) = held.take() {
                if self.processor.is_ready_for_message(&record) {
                    self.handle_record(record, &mut pending_deliveries).await?;
                    continue;
                }
                // Saturated: only an ack (which can complete a head group and
                // free capacity) or shutdown may unblock; input stays paused.
                held = Some(record);
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    Some(delivery) = pending_deliveries.next(), if !pending_deliveries.is_empty() => {
                        self.apply_delivery(delivery).await?;
                    }
                    _ = mark_interval.tick() => {
                        self.processor.mark_offsets_if_possible().await?;
                    }
                }
                continue;
            }

            tokio::select! {
                _ = cancel_token.cancelled() => {
                    info!(
                        partition = self.processor.partition(),
                        "Shutdown signal received, stopping partition worker"
                    );
                    break;
                }
                Some(delivery) = pending_deliveries.next(), if !pending_deliveries.is_empty() => {
                    self.apply_delivery(delivery).await?;
                }
                _ = mark_interval.tick() => {
                    self.processor.mark_offsets_if_possible().await?;
                }
                next = inputs.next() => match next {
                    Some((_, Ok(record))) => held = Some(record),
                    Some((topic, Err(e))) => {
                        error!(
                            topic = %topic,
                            partition = self.processor.partition(),
                            error = %e,
                            "Partition consumer failed, stopping partition worker"
                        );
                        input_failure = Some(e);
                        break;
                    }
                    None => {
                        info!(
                            partition = self.processor.partition(),
                            "All partition consumers closed, stopping partition worker"
                        );
                        break;
                    }
                },
            }
        }

        self.drain_pending_deliveries(pending_deliveries).await;
        let shutdown_result = self.processor.on_shutdown().await;
        match input_failure {
            Some(e) => Err(e),
            None => shutdown_result,
        }
    }

    async fn handle_record(
        &mut self,
        record: ConsumerRecord,
        pending_deliveries: &mut FuturesUnordered<DeliveryHandle>,
    ) -> Result<()> {
        let metrics = partition_metrics();
        metrics.read_total.get_or_create(&self.common_labels).inc();

        let producer_records = self.processor.process(record)?;
        let produced = producer_records.len() as u64;
        for producer_record in producer_records {
            let handle = self.producer.send(producer_record).await?;
            pending_deliveries.push(handle);
        }
        if produced > 0 {
            metrics
                .produced_total
                .get_or_create(&self.common_labels)
                .inc_by(produced);
        }
        self.processor.on_process_completed();
        metrics
            .in_flight_groups
            .get_or_create(&self.common_labels)
            .set(self.processor.total_in_flight_groups() as i64);
        Ok(())
    }

    async fn apply_delivery(&mut self, delivery: Delivery) -> Result<()> {
        let tag = delivery
            .map_err(|_| Error::ActorPatternRecv("Producer dropped a delivery handle".into()))??;
        self.processor.on_producer_ack(&tag)?;
        let metrics = partition_metrics();
        metrics.ack_total.get_or_create(&self.common_labels).inc();
        self.processor.mark_offsets_if_possible().await?;
        metrics
            .in_flight_groups
            .get_or_create(&self.common_labels)
            .set(self.processor.total_in_flight_groups() as i64);
        Ok(())
    }

    async fn drain_pending_deliveries(
        &mut self,
        mut pending_deliveries: FuturesUnordered<DeliveryHandle>,
    ) {
        if pending_deliveries.is_empty() {
            return;
        }
        info!(
            pending = pending_deliveries.len(),
            "Draining pending produce acknowledgements"
        );
        let grace = self.processor.settings().shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(delivery) = pending_deliveries.next().await {
                if let Err(e) = self.apply_delivery(delivery).await {
                    warn!(?e, "Error while draining pending acknowledgements");
                    break;
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Timed out waiting for pending produce acknowledgements");
        }
    }
}
