use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};

use crate::broker::{ProduceRequest, PublishError, Publisher};
use crate::config::KafkaConfig;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka publisher backed by a shared `FutureProducer`.
///
/// The producer is safe for concurrent use from any number of publisher
/// tasks; `acks=all` makes the returned future resolve only after the
/// broker has durably acknowledged the message.
pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPublisher {
    /// Creates the producer and verifies the cluster is reachable within
    /// [`PROBE_TIMEOUT`].
    pub fn connect(cfg: &KafkaConfig) -> Result<Self, PublishError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", cfg.addresses.clone())
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .create()
            .map_err(PublishError::broker)?;

        producer
            .client()
            .fetch_metadata(None, PROBE_TIMEOUT)
            .map_err(PublishError::broker)?;

        tracing::info!(addresses = %cfg.addresses, "kafka producer connected");

        Ok(Self {
            producer,
            timeout: Duration::from_secs(5),
        })
    }

    /// Set a custom timeout for enqueueing into the client's send buffer.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    /// Maps the request onto the wire record:
    /// - `topic` → Kafka topic
    /// - `partition_key` → Kafka message key, when present
    /// - `headers` → Kafka record headers, verbatim
    /// - `payload` → message value
    async fn publish(&self, msg: ProduceRequest) -> Result<(), PublishError> {
        let headers = msg
            .headers
            .iter()
            .fold(OwnedHeaders::new_with_capacity(msg.headers.len()), |acc, (key, value)| {
                acc.insert(Header {
                    key,
                    value: Some(value.as_str()),
                })
            });

        let mut record = FutureRecord::<String, Vec<u8>>::to(&msg.topic)
            .payload(&msg.payload)
            .headers(headers);
        if let Some(key) = &msg.partition_key {
            record = record.key(key);
        }

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(err, _)| PublishError::broker(err))?;

        Ok(())
    }
}
