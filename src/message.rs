use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A persisted outbox row: one event awaiting delivery to the broker.
///
/// Rows are created by the write path inside the same transaction as the
/// business change they describe, and finalized exactly once by the relay.
/// The id is a UUIDv7, so sorting by id reproduces insertion order for a
/// single writer.
///
/// A row is *unprocessed* while `processed_at` is `None`. Once set, the row
/// is terminal: `error == None` means the broker acknowledged the message at
/// least once, `error == Some(..)` records a failed publish attempt that
/// will not be retried.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub id: Uuid,
    /// Routing label for the broker. Opaque to the relay.
    pub topic: String,
    /// Optional broker partitioning key; equal keys keep their relative
    /// order on the broker.
    pub partition_key: Option<String>,
    /// Propagation data (trace carrier, correlation id).
    pub headers: HashMap<String, String>,
    /// Serialized event payload.
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OutboxMessage {
    /// Materializes a new unprocessed row from insert parameters.
    pub fn new(params: NewOutboxMessage) -> Self {
        Self {
            id: Uuid::now_v7(),
            topic: params.topic,
            partition_key: params.partition_key,
            headers: params.headers,
            payload: params.payload,
            created_at: Utc::now(),
            processed_at: None,
            error: None,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

/// Parameters for appending one row to the outbox.
#[derive(Debug, Clone, Default)]
pub struct NewOutboxMessage {
    pub topic: String,
    pub partition_key: Option<String>,
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

/// Outcome of one publish attempt, recorded by the relay's bulk update.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageOutcome {
    pub id: Uuid,
    /// `None` if the broker acknowledged the message, otherwise the
    /// rendered publish error.
    pub error: Option<String>,
}

impl MessageOutcome {
    pub fn delivered(id: Uuid) -> Self {
        Self { id, error: None }
    }

    pub fn failed(id: Uuid, error: impl Into<String>) -> Self {
        Self {
            id,
            error: Some(error.into()),
        }
    }
}
