use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::catalog::{Product, ProductStore};
use crate::message::{MessageOutcome, NewOutboxMessage, OutboxMessage};
use crate::store::{OutboxStore, Store, StoreError};

/// An in-memory storage backend for testing or local usage.
///
/// Behaves like a single-connection database: `begin` takes the state lock
/// for the lifetime of the transaction, mutations are staged on the handle,
/// and only `commit` applies them. Dropping the handle without committing
/// discards the staged work, exactly like a rolled-back transaction.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

#[derive(Default)]
struct State {
    messages: Vec<OutboxMessage>,
    products: Vec<Product>,
}

/// Transaction handle staging mutations until commit.
pub struct InMemoryTx {
    guard: OwnedMutexGuard<State>,
    staged_messages: Vec<OutboxMessage>,
    staged_products: Vec<Product>,
    staged_outcomes: Vec<MessageOutcome>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every committed outbox row, in insertion order.
    pub async fn messages(&self) -> Vec<OutboxMessage> {
        self.state.lock().await.messages.clone()
    }

    /// Committed rows the relay has not finalized yet.
    pub async fn unprocessed_count(&self) -> usize {
        self.state
            .lock()
            .await
            .messages
            .iter()
            .filter(|msg| !msg.is_processed())
            .count()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        Ok(InMemoryTx {
            guard: Arc::clone(&self.state).lock_owned().await,
            staged_messages: Vec::new(),
            staged_products: Vec::new(),
            staged_outcomes: Vec::new(),
        })
    }

    async fn commit(&self, mut tx: Self::Tx) -> Result<(), StoreError> {
        let now = Utc::now();
        let state = &mut *tx.guard;
        state.products.append(&mut tx.staged_products);
        state.messages.append(&mut tx.staged_messages);
        for outcome in tx.staged_outcomes.drain(..) {
            if let Some(row) = state.messages.iter_mut().find(|msg| msg.id == outcome.id) {
                if row.processed_at.is_none() {
                    row.processed_at = Some(now);
                    row.error = outcome.error;
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        drop(tx);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn insert_message(
        &self,
        params: NewOutboxMessage,
        tx: &mut Self::Tx,
    ) -> Result<OutboxMessage, StoreError> {
        let row = OutboxMessage::new(params);
        tx.staged_messages.push(row.clone());
        Ok(row)
    }

    async fn list_unprocessed(
        &self,
        batch_size: u32,
        tx: &mut Self::Tx,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let mut rows: Vec<OutboxMessage> = tx
            .guard
            .messages
            .iter()
            .chain(tx.staged_messages.iter())
            .filter(|msg| !msg.is_processed())
            .cloned()
            .collect();
        rows.sort_by_key(|msg| msg.id);
        rows.truncate(batch_size as usize);
        Ok(rows)
    }

    async fn bulk_mark_processed(
        &self,
        outcomes: &[MessageOutcome],
        tx: &mut Self::Tx,
    ) -> Result<(), StoreError> {
        tx.staged_outcomes.extend_from_slice(outcomes);
        Ok(())
    }
}

#[async_trait]
impl ProductStore for InMemoryStore {
    async fn insert_product(
        &self,
        product: &Product,
        tx: &mut Self::Tx,
    ) -> Result<(), StoreError> {
        let taken = tx
            .guard
            .products
            .iter()
            .chain(tx.staged_products.iter())
            .any(|existing| existing.sku == product.sku);
        if taken {
            return Err(StoreError::unique_violation("products_sku_key"));
        }
        tx.staged_products.push(product.clone());
        Ok(())
    }

    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        Ok(self.state.lock().await.products.clone())
    }
}
