//! Relay worker delivering outbox rows to the broker.
//!
//! The relay is a single long-lived loop. Each tick runs inside one store
//! transaction: read a batch of unprocessed rows in id order, publish every
//! row concurrently, wait for all of them, finalize the whole batch with
//! one bulk update, commit. Ticks never overlap; the next tick starts one
//! interval after the previous tick completed.
//!
//! Holding one transaction across the read and the bulk update keeps the
//! batch claimed for the whole tick: a store failure anywhere rolls the
//! tick back and the same rows are picked up again on the next tick
//! (at-least-once). A failed publish does not abort the tick; the broker
//! error is recorded on that row and the row is terminal: it will not be
//! retried.
//!
//! Publishes within one tick race each other. Ordering across ticks is
//! FIFO by id only; consumers that need ordering must route related rows
//! through an equal `partition_key`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::broker::{ProduceRequest, PublishError, Publisher};
use crate::message::{MessageOutcome, OutboxMessage};
use crate::propagation;
use crate::store::{with_tx, OutboxStore, StoreError};

const DEFAULT_BATCH_SIZE: u32 = 100;
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Periodic worker publishing unprocessed outbox rows.
pub struct Relay<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    batch_size: u32,
    interval: Duration,
    grace: Duration,
}

impl<S, P> Relay<S, P>
where
    S: OutboxStore + 'static,
    P: Publisher + 'static,
{
    pub fn new(store: Arc<S>, publisher: Arc<P>) -> Self {
        Self {
            store,
            publisher,
            batch_size: DEFAULT_BATCH_SIZE,
            interval: DEFAULT_INTERVAL,
            grace: DEFAULT_GRACE,
        }
    }

    /// Maximum rows fetched per tick.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Delay between tick completion and the next tick.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// How long [`RelayHandle::stop`] waits for an in-flight tick before
    /// cancelling its transaction.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Starts the worker loop in the background.
    pub fn run(self) -> RelayHandle {
        let stop = CancellationToken::new();
        let cancel = CancellationToken::new();
        let grace = self.grace;
        let task = tokio::spawn(self.run_loop(stop.clone(), cancel.clone()));
        RelayHandle {
            stop,
            cancel,
            grace,
            task,
        }
    }

    async fn run_loop(self, stop: CancellationToken, cancel: CancellationToken) {
        tracing::info!("relay is starting up");
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }

            tokio::select! {
                biased;
                // Dropping the tick future here drops its transaction, which
                // rolls the batch back; the rows stay unprocessed.
                _ = cancel.cancelled() => break,
                result = self.tick(&cancel) => {
                    if let Err(err) = result {
                        tracing::error!(error = %err, "error relaying outbox messages");
                    }
                }
            }
        }
        tracing::info!("relay is shutting down");
    }

    #[tracing::instrument(skip_all)]
    async fn tick(&self, cancel: &CancellationToken) -> Result<(), StoreError> {
        let cancel = cancel.clone();
        let store = Arc::clone(&self.store);
        let publisher = Arc::clone(&self.publisher);
        let batch_size = self.batch_size;
        with_tx(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                let rows = store.list_unprocessed(batch_size, tx).await?;
                if rows.is_empty() {
                    return Ok(());
                }
                tracing::info!(count = rows.len(), "relaying outbox messages");

                // One task per row; every task emits exactly one outcome.
                let tasks: Vec<(uuid::Uuid, JoinHandle<MessageOutcome>)> = rows
                    .into_iter()
                    .map(|row| {
                        let publisher = Arc::clone(&publisher);
                        let cancel = cancel.clone();
                        (row.id, tokio::spawn(publish_row(publisher, row, cancel)))
                    })
                    .collect();

                let mut outcomes = Vec::with_capacity(tasks.len());
                for (id, task) in tasks {
                    let outcome = match task.await {
                        Ok(outcome) => outcome,
                        // A panicking publisher must not take the worker
                        // down; the row is finalized with the panic recorded.
                        Err(err) => {
                            tracing::error!(outbox_msg_id = %id, error = %err, "publisher task failed");
                            MessageOutcome::failed(id, format!("publisher task failed: {err}"))
                        }
                    };
                    outcomes.push(outcome);
                }

                store.bulk_mark_processed(&outcomes, tx).await
            })
        })
        .await
    }
}

async fn publish_row<P: Publisher>(
    publisher: Arc<P>,
    row: OutboxMessage,
    cancel: CancellationToken,
) -> MessageOutcome {
    let span = propagation::delivery_span(&row);
    let id = row.id;
    async move {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PublishError::cancelled()),
            result = publisher.publish(ProduceRequest::from(&row)) => result,
        };

        match result {
            Ok(()) => MessageOutcome::delivered(id),
            Err(err) => {
                if err.is_cancelled() {
                    tracing::debug!(outbox_msg_id = %id, "publish cancelled during shutdown");
                } else {
                    tracing::error!(
                        outbox_msg_id = %id,
                        topic = %row.topic,
                        error = %err,
                        "error publishing outbox message"
                    );
                }
                MessageOutcome::failed(id, err.to_string())
            }
        }
    }
    .instrument(span)
    .await
}

/// Handle to a running relay. Stopping consumes the handle, so a stop can
/// only be issued once.
pub struct RelayHandle {
    stop: CancellationToken,
    cancel: CancellationToken,
    grace: Duration,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Signals the loop and waits for it to finish. An in-flight tick gets
    /// the grace period to complete; after that its transaction context is
    /// cancelled, the store rolls the batch back, and any in-flight
    /// publishes abort. Rows affected by a cancelled tick stay unprocessed
    /// and are retried on the next start.
    pub async fn stop(mut self) {
        self.stop.cancel();
        if tokio::time::timeout(self.grace, &mut self.task)
            .await
            .is_err()
        {
            tracing::warn!("relay tick exceeded shutdown grace, cancelling");
            self.cancel.cancel();
            let _ = (&mut self.task).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use tokio::time::{advance, sleep, Duration};

    use super::*;
    use crate::broker::inmemory::InMemoryBroker;
    use crate::message::NewOutboxMessage;
    use crate::store::inmemory::InMemoryStore;
    use crate::store::Store;

    fn params(topic: &str, key: Option<&str>) -> NewOutboxMessage {
        NewOutboxMessage {
            topic: topic.to_owned(),
            partition_key: key.map(str::to_owned),
            headers: HashMap::new(),
            payload: br#"{"sku":"A"}"#.to_vec(),
        }
    }

    async fn insert_messages(store: &InMemoryStore, count: usize, topic: &str) {
        let mut tx = store.begin().await.unwrap();
        for _ in 0..count {
            store
                .insert_message(params(topic, None), &mut tx)
                .await
                .unwrap();
        }
        store.commit(tx).await.unwrap();
    }

    /// Polls until the broker has acknowledged `count` messages. The clock
    /// is virtual, so the bound is far past any realistic tick schedule.
    async fn wait_for_sent(broker: &InMemoryBroker, count: usize) {
        for _ in 0..2_000 {
            if broker.sent().await.len() == count {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("broker never reached {count} acknowledged messages");
    }

    /// Polls until every committed outbox row has been finalized.
    async fn wait_for_drained(store: &InMemoryStore) {
        for _ in 0..2_000 {
            if store.unprocessed_count().await == 0 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("outbox still has unprocessed rows");
    }

    fn relay(store: &Arc<InMemoryStore>, broker: &Arc<InMemoryBroker>) -> Relay<InMemoryStore, InMemoryBroker> {
        Relay::new(Arc::clone(store), Arc::clone(broker))
            .with_batch_size(10)
            .with_interval(Duration::from_millis(50))
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_publishes_and_finalizes_the_batch() {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        insert_messages(&store, 3, "product.created").await;

        let handle = relay(&store, &broker).run();

        wait_for_sent(&broker, 3).await;
        wait_for_drained(&store).await;

        for msg in store.messages().await {
            assert!(msg.is_processed());
            assert_eq!(msg.error, None);
        }
        for sent in broker.sent().await {
            assert_eq!(sent.topic, "product.created");
            assert_eq!(sent.payload, br#"{"sku":"A"}"#.to_vec());
        }

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn broker_failure_is_terminal_per_row() {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        broker.set_failing(true).await;
        insert_messages(&store, 2, "product.created").await;

        let handle = relay(&store, &broker).run();

        // The first tick records the failure and finalizes both rows.
        wait_for_drained(&store).await;
        for msg in store.messages().await {
            assert!(msg.is_processed());
            assert!(msg.error.is_some());
        }

        // Rows inserted after the broker recovers go through; the failed
        // ones are never retried.
        broker.set_failing(false).await;
        insert_messages(&store, 2, "product.created").await;
        wait_for_sent(&broker, 2).await;
        wait_for_drained(&store).await;

        let failed = store
            .messages()
            .await
            .iter()
            .filter(|msg| msg.error.is_some())
            .count();
        assert_eq!(failed, 2);
        assert_eq!(broker.sent().await.len(), 2);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn batch_larger_than_available_drains_in_one_tick() {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        insert_messages(&store, 7, "product.created").await;

        let handle = Relay::new(Arc::clone(&store), Arc::clone(&broker))
            .with_batch_size(100)
            .with_interval(Duration::from_millis(50))
            .run();

        // One interval, one tick: everything published before a second
        // tick could have fired.
        wait_for_sent(&broker, 7).await;
        assert_eq!(store.unprocessed_count().await, 0);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn claims_rows_in_id_order_across_ticks() {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());

        let mut expected = Vec::new();
        let mut tx = store.begin().await.unwrap();
        for topic in ["a", "b", "c", "d"] {
            let row = store.insert_message(params(topic, None), &mut tx).await.unwrap();
            expected.push(row.topic);
        }
        store.commit(tx).await.unwrap();

        // One row per tick makes claim order observable as publish order.
        let handle = Relay::new(Arc::clone(&store), Arc::clone(&broker))
            .with_batch_size(1)
            .with_interval(Duration::from_millis(50))
            .run();

        wait_for_sent(&broker, 4).await;
        let sent: Vec<String> = broker
            .sent()
            .await
            .into_iter()
            .map(|req| req.topic)
            .collect();
        assert_eq!(sent, expected);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_tick_rolls_the_batch_back() {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        broker.stall_partition("stuck").await;

        let mut tx = store.begin().await.unwrap();
        for _ in 0..4 {
            store
                .insert_message(params("product.created", None), &mut tx)
                .await
                .unwrap();
        }
        store
            .insert_message(params("product.created", Some("stuck")), &mut tx)
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let handle = relay(&store, &broker).run();

        // Let the tick start and wedge on the stalled publish.
        wait_for_sent(&broker, 4).await;

        let started = tokio::time::Instant::now();
        handle.stop().await;
        assert!(started.elapsed() <= DEFAULT_GRACE + Duration::from_secs(1));

        // The tick never finalized: its transaction was rolled back and
        // every row is still unprocessed.
        assert_eq!(store.unprocessed_count().await, 5);

        // A fresh relay picks all five up again; the consumer may see the
        // first four twice, which is the at-least-once contract.
        broker.release_stalled().await;
        let handle = relay(&store, &broker).run();
        wait_for_drained(&store).await;
        assert_eq!(broker.sent().await.len(), 9);
        for msg in store.messages().await {
            assert_eq!(msg.error, None);
        }

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_inflight_tick_returns_promptly() {
        let store = Arc::new(InMemoryStore::new());
        let broker = Arc::new(InMemoryBroker::new());

        let handle = relay(&store, &broker).run();
        advance(Duration::from_millis(10)).await;

        let started = tokio::time::Instant::now();
        handle.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    struct PanickingPublisher {
        panic_on: String,
        inner: InMemoryBroker,
    }

    #[async_trait]
    impl Publisher for PanickingPublisher {
        async fn publish(&self, msg: ProduceRequest) -> Result<(), PublishError> {
            assert!(
                msg.topic != self.panic_on,
                "injected panic for {}",
                msg.topic
            );
            self.inner.publish(msg).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publisher_panic_is_recorded_and_does_not_kill_the_worker() {
        let store = Arc::new(InMemoryStore::new());
        let publisher = Arc::new(PanickingPublisher {
            panic_on: "explosive".to_owned(),
            inner: InMemoryBroker::new(),
        });

        let mut tx = store.begin().await.unwrap();
        store
            .insert_message(params("explosive", None), &mut tx)
            .await
            .unwrap();
        store
            .insert_message(params("calm", None), &mut tx)
            .await
            .unwrap();
        store.commit(tx).await.unwrap();

        let handle = Relay::new(Arc::clone(&store), Arc::clone(&publisher))
            .with_batch_size(10)
            .with_interval(Duration::from_millis(50))
            .run();

        wait_for_drained(&store).await;

        let messages = store.messages().await;
        let exploded = messages.iter().find(|m| m.topic == "explosive").unwrap();
        let calm = messages.iter().find(|m| m.topic == "calm").unwrap();
        assert!(exploded.error.as_deref().unwrap().contains("task failed"));
        assert_eq!(calm.error, None);

        // The worker survived; later rows still flow.
        insert_messages(&store, 1, "calm").await;
        wait_for_drained(&store).await;

        handle.stop().await;
    }
}
