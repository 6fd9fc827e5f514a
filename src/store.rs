//! Storage abstractions and backend drivers.
//!
//! The store exposes one capability set: it can begin a unit of work and
//! execute outbox operations against it. The two backends are
//! [`postgres`] (production, sqlx) and [`inmemory`] (tests and local
//! pipelines). Callers consume the capability, never a concrete handle.
//!
//! ## Components
//!
//! - [`Store`]: transaction lifecycle (`begin`/`commit`/`rollback`) over an
//!   associated [`Store::Tx`] handle
//! - [`OutboxStore`]: the outbox operations, all parameterized by a live
//!   transaction
//! - [`with_tx`]: runs a closure inside a transaction, committing on `Ok`
//!   and rolling back on `Err`
//!
//! Components that need to share a transaction take `&mut S::Tx` and pass
//! the same borrow to their callees; there are no savepoints and no second
//! handle variant.

pub mod inmemory;
pub mod postgres;

use async_trait::async_trait;
use futures_core::future::BoxFuture;
use tracing_error::SpanTrace;

use crate::message::{MessageOutcome, NewOutboxMessage, OutboxMessage};

/// Transaction lifecycle offered by a storage backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Live transaction handle. Dropping it without [`Store::commit`]
    /// discards every operation staged on it.
    type Tx: Send;

    /// Opens a new transaction.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Makes every operation staged on `tx` durable.
    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError>;

    /// Discards every operation staged on `tx`.
    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError>;

    /// Cheap reachability probe for health checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Outbox operations. Every mutation takes the caller's transaction; the
/// store never hides a transaction boundary of its own.
#[async_trait]
pub trait OutboxStore: Store {
    /// Appends one unprocessed row and returns it.
    async fn insert_message(
        &self,
        params: NewOutboxMessage,
        tx: &mut Self::Tx,
    ) -> Result<OutboxMessage, StoreError>;

    /// Returns up to `batch_size` unprocessed rows in ascending id order.
    /// May be empty.
    async fn list_unprocessed(
        &self,
        batch_size: u32,
        tx: &mut Self::Tx,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    /// Finalizes every listed row in a single statement, setting
    /// `processed_at = now` and recording the per-row error. Unknown ids
    /// are silently ignored; already-finalized rows are left untouched.
    async fn bulk_mark_processed(
        &self,
        outcomes: &[MessageOutcome],
        tx: &mut Self::Tx,
    ) -> Result<(), StoreError>;
}

/// Runs `f` inside a transaction on `store`.
///
/// Commits iff `f` returns `Ok`; otherwise rolls back and returns the
/// original error, with any rollback failure attached to it. Callees that
/// should join the transaction take the `&mut S::Tx` borrow as a parameter.
pub async fn with_tx<S, T, F>(store: &S, f: F) -> Result<T, StoreError>
where
    S: Store + ?Sized,
    T: Send,
    F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T, StoreError>> + Send,
{
    let mut tx = store.begin().await?;
    match f(&mut tx).await {
        Ok(value) => {
            store.commit(tx).await?;
            Ok(value)
        }
        Err(err) => Err(match store.rollback(tx).await {
            Ok(()) => err,
            Err(rollback_err) => err.join_rollback(rollback_err),
        }),
    }
}

/// Error returned by store operations.
///
/// Wraps the backend error and captures a tracing span backtrace for
/// improved diagnostics.
#[derive(Debug)]
pub struct StoreError {
    context: SpanTrace,
    kind: StoreErrorKind,
}

/// Kinds of store errors.
#[derive(Debug)]
pub enum StoreErrorKind {
    /// Database driver failure.
    Database(sqlx::Error),
    /// A unique constraint rejected the write.
    UniqueViolation { constraint: String },
    /// Header or payload (de)serialization failure.
    Serde(serde_json::Error),
    /// Backend-specific failure (in-memory driver, startup probes).
    Backend(tower::BoxError),
    /// The rollback after a failed unit of work failed as well.
    RollbackFailed {
        source: Box<StoreError>,
        rollback: Box<StoreError>,
    },
}

impl StoreError {
    fn new(kind: StoreErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub(crate) fn serde(err: serde_json::Error) -> Self {
        Self::new(StoreErrorKind::Serde(err))
    }

    pub(crate) fn backend(err: impl Into<tower::BoxError>) -> Self {
        Self::new(StoreErrorKind::Backend(err.into()))
    }

    pub(crate) fn unique_violation(constraint: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::UniqueViolation {
            constraint: constraint.into(),
        })
    }

    fn join_rollback(self, rollback: StoreError) -> Self {
        Self::new(StoreErrorKind::RollbackFailed {
            source: Box::new(self),
            rollback: Box::new(rollback),
        })
    }

    /// Name of the violated unique constraint, if that is what failed.
    pub fn constraint(&self) -> Option<&str> {
        match &self.kind {
            StoreErrorKind::UniqueViolation { constraint } => Some(constraint),
            StoreErrorKind::RollbackFailed { source, .. } => source.constraint(),
            _ => None,
        }
    }

    pub fn kind(&self) -> &StoreErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            StoreErrorKind::Database(err) => writeln!(f, "Database error: {err}"),
            StoreErrorKind::UniqueViolation { constraint } => {
                writeln!(f, "Unique constraint violated: {constraint}")
            }
            StoreErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            StoreErrorKind::Backend(err) => writeln!(f, "Backend error: {err}"),
            StoreErrorKind::RollbackFailed { source, rollback } => {
                writeln!(f, "{source}Rollback also failed: {rollback}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            StoreErrorKind::Database(err) => Some(err),
            StoreErrorKind::UniqueViolation { .. } => None,
            StoreErrorKind::Serde(err) => Some(err),
            StoreErrorKind::Backend(err) => Some(err.as_ref()),
            StoreErrorKind::RollbackFailed { source, .. } => Some(source.as_ref()),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let constraint = match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                db.constraint().map(str::to_owned)
            }
            _ => None,
        };
        match constraint {
            Some(constraint) => Self::unique_violation(constraint),
            None => Self::new(StoreErrorKind::Database(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::inmemory::InMemoryStore;
    use super::*;
    use crate::message::NewOutboxMessage;

    fn params(topic: &str) -> NewOutboxMessage {
        NewOutboxMessage {
            topic: topic.to_owned(),
            payload: b"{}".to_vec(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn with_tx_commits_on_ok() {
        let store = InMemoryStore::new();

        let inner = store.clone();
        with_tx(&store, move |tx| {
            Box::pin(async move { inner.insert_message(params("a"), tx).await.map(|_| ()) })
        })
        .await
        .unwrap();

        assert_eq!(store.messages().await.len(), 1);
    }

    #[tokio::test]
    async fn with_tx_rolls_back_on_err() {
        let store = InMemoryStore::new();

        let inner = store.clone();
        let result: Result<(), StoreError> = with_tx(&store, move |tx| {
            Box::pin(async move {
                inner.insert_message(params("a"), tx).await?;
                Err(StoreError::backend("boom"))
            })
        })
        .await;

        assert!(result.is_err());
        assert!(store.messages().await.is_empty());
    }

    #[test]
    fn unique_violation_exposes_constraint() {
        let err = StoreError::unique_violation("products_sku_key");
        assert_eq!(err.constraint(), Some("products_sku_key"));
    }
}
