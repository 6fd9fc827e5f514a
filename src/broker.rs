//! Broker publishing abstractions and sender backends.
//!
//! The broker surface is a single operation: publish one message and return
//! once the broker has durably acknowledged it. Backends are [`kafka`]
//! (production, rdkafka) and [`inmemory`] (tests and local pipelines).
//!
//! Publishers are safe for concurrent use; ordering between concurrent
//! publishes is not guaranteed. Callers that need ordering route related
//! messages through an equal `partition_key` and rely on the broker's
//! per-key ordering. Abandoning the returned future (dropping it on
//! cancellation) abandons the wait, not necessarily the send: the message
//! may or may not have been accepted server-side.

pub mod inmemory;
pub mod kafka;

use std::collections::HashMap;

use async_trait::async_trait;
use tracing_error::SpanTrace;

use crate::message::OutboxMessage;

/// One message handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceRequest {
    pub topic: String,
    /// Broker partitioning key. Absent means broker-chosen partition.
    pub partition_key: Option<String>,
    /// Transmitted verbatim as opaque key/value pairs.
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl From<&OutboxMessage> for ProduceRequest {
    fn from(msg: &OutboxMessage) -> Self {
        Self {
            topic: msg.topic.clone(),
            partition_key: msg.partition_key.clone(),
            headers: msg.headers.clone(),
            payload: msg.payload.clone(),
        }
    }
}

/// Trait implemented by concrete broker backends.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes one message, resolving only once the broker has durably
    /// acknowledged it or the produce pipeline reported failure.
    async fn publish(&self, msg: ProduceRequest) -> Result<(), PublishError>;
}

/// Error returned by publish operations.
#[derive(Debug)]
pub struct PublishError {
    context: SpanTrace,
    kind: PublishErrorKind,
}

/// Kinds of publish errors.
#[derive(Debug)]
pub enum PublishErrorKind {
    /// The broker or its client library rejected the message.
    Broker(tower::BoxError),
    /// The publish was cancelled before the broker acknowledged it.
    Cancelled,
}

impl PublishError {
    pub fn broker(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::Broker(err.into()),
        }
    }

    pub(crate) fn cancelled() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: PublishErrorKind::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, PublishErrorKind::Cancelled)
    }

    pub fn kind(&self) -> &PublishErrorKind {
        &self.kind
    }

    /// Span backtrace captured where the error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.context
    }
}

// Single line: rendered into the outbox `error` column and log fields.
impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PublishErrorKind::Broker(err) => write!(f, "broker error: {err}"),
            PublishErrorKind::Cancelled => {
                write!(f, "publish cancelled before broker acknowledgement")
            }
        }
    }
}

impl std::error::Error for PublishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PublishErrorKind::Broker(err) => Some(err.as_ref()),
            PublishErrorKind::Cancelled => None,
        }
    }
}
