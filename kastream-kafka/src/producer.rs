use std::time::Duration;

use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::oneshot;
use tracing::error;

use kastream_core::broker::{DeliveryHandle, Producer};
use kastream_core::message::ProducerRecord;

use crate::{Error, KafkaConfig, Result};

const QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared producer handle. Cloning is cheap; one instance serves every
/// partition worker in the process.
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer =
            config
                .producer_client_config()?
                .create()
                .map_err(|err| Error::Connection {
                    server: config.brokers.join(","),
                    error: err.to_string(),
                })?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn send(&self, record: ProducerRecord) -> kastream_core::Result<DeliveryHandle> {
        let (tx, rx) = oneshot::channel();
        let producer = self.producer.clone();
        tokio::spawn(async move {
            let ProducerRecord {
                topic,
                key,
                value,
                tag,
            } = record;
            let mut future_record: FutureRecord<'_, [u8], [u8]> =
                FutureRecord::to(&topic).payload(value.as_ref());
            if !key.is_empty() {
                future_record = future_record.key(key.as_ref());
            }
            let outcome = match producer.send(future_record, QUEUE_TIMEOUT).await {
                Ok(_) => Ok(tag),
                Err((e, _)) => {
                    error!(?e, topic, "Failed to produce record");
                    Err(kastream_core::Error::Producer(e.to_string()))
                }
            };
            let _ = tx.send(outcome);
        });
        Ok(rx)
    }
}
