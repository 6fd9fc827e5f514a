//! Kafka consumer service for domain events.
//!
//! Handlers are registered per topic before the service starts. Each
//! consumed record is dispatched on its own task so a panicking handler is
//! isolated at the task boundary and recorded instead of taking the
//! consumer down. Offsets are committed after the handler ran; a failed
//! handler is logged and the record is not redelivered by us (the broker's
//! at-least-once semantics still apply across restarts).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_core::future::BoxFuture;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::config::KafkaConfig;
use crate::propagation;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One consumed record, reduced to what handlers need.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub correlation_id: Option<String>,
    pub payload: Vec<u8>,
}

/// Async handler invoked for every record on its topic.
pub type Handler =
    Arc<dyn Fn(Delivery) -> BoxFuture<'static, Result<(), tower::BoxError>> + Send + Sync>;

/// Topic → handler registry, assembled before the consumer starts.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `topic`. At most one handler per topic.
    pub fn register(
        &mut self,
        topic: impl Into<String>,
        handler: Handler,
    ) -> Result<(), ConsumeError> {
        let topic = topic.into();
        if self.handlers.contains_key(&topic) {
            return Err(ConsumeError::already_registered(topic));
        }
        self.handlers.insert(topic, handler);
        Ok(())
    }

    pub fn topics(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    fn get(&self, topic: &str) -> Option<&Handler> {
        self.handlers.get(topic)
    }
}

/// Kafka consumer loop dispatching records to registered handlers.
pub struct ConsumerService {
    consumer: StreamConsumer,
    registry: HandlerRegistry,
}

impl ConsumerService {
    /// Creates the consumer and verifies the cluster is reachable within
    /// [`PROBE_TIMEOUT`].
    pub fn connect(cfg: &KafkaConfig, registry: HandlerRegistry) -> Result<Self, ConsumeError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", cfg.addresses.clone())
            .set("group.id", cfg.group.clone())
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(ConsumeError::kafka)?;

        consumer
            .client()
            .fetch_metadata(None, PROBE_TIMEOUT)
            .map_err(ConsumeError::kafka)?;

        Ok(Self { consumer, registry })
    }

    /// Runs until cancelled.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ConsumeError> {
        let topics = self.registry.topics();
        if topics.is_empty() {
            tracing::warn!("consumer started with no registered handlers");
            cancel.cancelled().await;
            return Ok(());
        }
        self.consumer
            .subscribe(&topics)
            .map_err(ConsumeError::kafka)?;
        tracing::info!(?topics, "consumer subscribed");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("consumer is shutting down");
                    return Ok(());
                }
                record = self.consumer.recv() => match record {
                    Err(err) => {
                        tracing::error!(error = %err, "error fetching messages");
                    }
                    Ok(record) => {
                        let delivery = Delivery {
                            topic: record.topic().to_owned(),
                            correlation_id: propagation::correlation_from_record(&record),
                            payload: record.payload().unwrap_or_default().to_vec(),
                        };
                        handle_record(&self.registry, delivery).await;

                        if let Err(err) = self.consumer.commit_message(&record, CommitMode::Async) {
                            tracing::error!(error = %err, "error committing offsets");
                        }
                    }
                }
            }
        }
    }
}

/// Dispatches one record to its handler on a dedicated task, so handler
/// panics stop at the task boundary.
async fn handle_record(registry: &HandlerRegistry, delivery: Delivery) {
    let topic = delivery.topic.clone();
    let correlation_id = delivery.correlation_id.clone();

    let Some(handler) = registry.get(&topic) else {
        tracing::error!(topic = %topic, "no handler registered for topic");
        return;
    };

    match tokio::spawn(handler.as_ref()(delivery)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::error!(topic = %topic, ?correlation_id, error = %err, "error handling message");
        }
        Err(err) if err.is_panic() => {
            tracing::error!(topic = %topic, ?correlation_id, error = %err, "panic in message handler");
        }
        Err(err) => {
            tracing::error!(topic = %topic, ?correlation_id, error = %err, "message handler aborted");
        }
    }
}

/// Error returned by consumer operations.
#[derive(Debug)]
pub struct ConsumeError {
    context: SpanTrace,
    kind: ConsumeErrorKind,
}

/// Kinds of consumer errors.
#[derive(Debug)]
pub enum ConsumeErrorKind {
    /// The Kafka client failed.
    Kafka(rdkafka::error::KafkaError),
    /// A second handler was registered for the same topic.
    HandlerAlreadyRegistered { topic: String },
}

impl ConsumeError {
    fn kafka(err: rdkafka::error::KafkaError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumeErrorKind::Kafka(err),
        }
    }

    fn already_registered(topic: String) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConsumeErrorKind::HandlerAlreadyRegistered { topic },
        }
    }

    pub fn kind(&self) -> &ConsumeErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ConsumeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ConsumeErrorKind::Kafka(err) => writeln!(f, "Kafka error: {err}"),
            ConsumeErrorKind::HandlerAlreadyRegistered { topic } => {
                writeln!(f, "Handler for topic {topic} already registered")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConsumeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ConsumeErrorKind::Kafka(err) => Some(err),
            ConsumeErrorKind::HandlerAlreadyRegistered { .. } => None,
        }
    }
}
