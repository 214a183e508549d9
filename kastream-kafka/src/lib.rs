//! rdkafka-backed implementation of the kastream broker traits: a client for
//! offset queries, per-partition consumers feeding record channels, committed
//! offset management, and a [FutureProducer]-based producer resolving
//! delivery handles on broker ack.
//!
//! [FutureProducer]: rdkafka::producer::FutureProducer

use std::collections::HashMap;

use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use tracing::warn;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Connecting to Kafka {server} - {error}")]
    Connection { server: String, error: String },

    #[error("Kafka - {0}")]
    Kafka(String),

    #[error("{0}")]
    Other(String),
}

impl From<Error> for kastream_core::Error {
    fn from(value: Error) -> Self {
        kastream_core::Error::Broker(value.to_string())
    }
}

/// Authentication mechanism for the Kafka connection.
#[derive(Debug, Clone, PartialEq)]
pub enum KafkaAuth {
    Sasl {
        mechanism: String,
        username: String,
        password: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub insecure_skip_verify: bool,
    pub ca_cert: Option<String>,
    pub client_auth: Option<TlsClientAuthCerts>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsClientAuthCerts {
    pub client_cert: String,
    pub client_cert_private_key: String,
}

/// Connection settings shared by the consumer, offset-manager and producer
/// sides of one worker deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaConfig {
    /// The list of Kafka brokers to connect to.
    pub brokers: Vec<String>,
    /// Consumer group owning the committed offsets.
    pub consumer_group: String,
    pub auth: Option<KafkaAuth>,
    pub tls: Option<TlsConfig>,
    /// Any supported librdkafka configuration option, passed through as-is.
    /// https://docs.confluent.io/platform/current/clients/librdkafka/html/md_CONFIGURATION.html
    pub raw_config: HashMap<String, String>,
}

impl KafkaConfig {
    pub fn new(brokers: Vec<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            brokers,
            consumer_group: consumer_group.into(),
            auth: None,
            tls: None,
            raw_config: HashMap::new(),
        }
    }

    pub(crate) fn consumer_client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("group.id", &self.consumer_group)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000");
        for (key, value) in &self.raw_config {
            config.set(key, value);
        }
        self.apply_security(&mut config)?;
        config.set_log_level(RDKafkaLogLevel::Warning);
        Ok(config)
    }

    pub(crate) fn producer_client_config(&self) -> Result<ClientConfig> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("message.timeout.ms", "5000")
            .set("client.id", "kastream-producer");
        for (key, value) in &self.raw_config {
            config.set(key, value);
        }
        self.apply_security(&mut config)?;
        config.set_log_level(RDKafkaLogLevel::Warning);
        Ok(config)
    }

    fn apply_security(&self, config: &mut ClientConfig) -> Result<()> {
        if let Some(KafkaAuth::Sasl {
            mechanism,
            username,
            password,
        }) = &self.auth
        {
            let supported_mechanisms = ["PLAIN", "SCRAM-SHA-256", "SCRAM-SHA-512"];
            if !supported_mechanisms.contains(&mechanism.as_str()) {
                return Err(Error::Kafka(format!(
                    "Unsupported SASL mechanism: {}. Currently supported mechanisms: {}",
                    mechanism,
                    supported_mechanisms.join(", ")
                )));
            }
            let protocol = if self.tls.is_some() {
                "SASL_SSL"
            } else {
                "SASL_PLAINTEXT"
            };
            config
                .set("security.protocol", protocol)
                .set("sasl.mechanisms", mechanism)
                .set("sasl.username", username)
                .set("sasl.password", password);
        }

        if let Some(tls_config) = &self.tls {
            if self.auth.is_none() {
                config.set("security.protocol", "SSL");
            }
            if tls_config.insecure_skip_verify {
                warn!(
                    "'insecure_skip_verify' is set, certificate validation will not be performed when connecting to the Kafka server"
                );
                config.set("enable.ssl.certificate.verification", "false");
            }
            if let Some(ca_cert) = &tls_config.ca_cert {
                config.set("ssl.ca.pem", ca_cert);
            }
            if let Some(client_auth) = &tls_config.client_auth {
                config
                    .set("ssl.certificate.pem", &client_auth.client_cert)
                    .set("ssl.key.pem", &client_auth.client_cert_private_key);
            }
        }
        Ok(())
    }
}

mod client;
mod producer;

pub use client::{
    KafkaClient, KafkaConsumer, KafkaPartitionConsumer, KafkaPartitionOffsetManager,
};
pub use producer::KafkaProducer;
