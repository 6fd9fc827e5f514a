use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::broker::{ProduceRequest, PublishError, Publisher};

/// An in-memory publisher for testing or local pipelines.
///
/// Records every acknowledged message in a shared queue. Tests can inject
/// broker downtime with [`InMemoryBroker::set_failing`] and simulate a
/// publish that never returns with [`InMemoryBroker::stall_partition`].
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
    released: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    sent: Vec<ProduceRequest>,
    failing: bool,
    stalled_keys: HashSet<String>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages acknowledged so far, in acknowledgement order.
    pub async fn sent(&self) -> Vec<ProduceRequest> {
        self.inner.lock().await.sent.clone()
    }

    /// While failing, every publish is rejected.
    pub async fn set_failing(&self, failing: bool) {
        self.inner.lock().await.failing = failing;
    }

    /// Publishes whose `partition_key` equals `key` block until
    /// [`InMemoryBroker::release_stalled`] is called.
    pub async fn stall_partition(&self, key: &str) {
        self.inner.lock().await.stalled_keys.insert(key.to_owned());
    }

    /// Unblocks every stalled publish.
    pub async fn release_stalled(&self) {
        self.inner.lock().await.stalled_keys.clear();
        self.released.notify_waiters();
    }

    async fn wait_while_stalled(&self, key: &str) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            {
                let inner = self.inner.lock().await;
                if !inner.stalled_keys.contains(key) {
                    return;
                }
                // Register for the wakeup before the lock is released so a
                // concurrent `release_stalled` cannot slip in between.
                released.as_mut().enable();
            }
            released.await;
        }
    }
}

#[async_trait]
impl Publisher for InMemoryBroker {
    #[tracing::instrument(skip_all, fields(topic = %msg.topic))]
    async fn publish(&self, msg: ProduceRequest) -> Result<(), PublishError> {
        if let Some(key) = msg.partition_key.as_deref() {
            self.wait_while_stalled(key).await;
        }

        let mut inner = self.inner.lock().await;
        if inner.failing {
            return Err(PublishError::broker("in-memory broker unavailable"));
        }
        inner.sent.push(msg);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(topic: &str, key: Option<&str>) -> ProduceRequest {
        ProduceRequest {
            topic: topic.to_owned(),
            partition_key: key.map(str::to_owned),
            headers: Default::default(),
            payload: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn records_acknowledged_messages() {
        let broker = InMemoryBroker::new();
        broker.publish(request("a", None)).await.unwrap();
        broker.publish(request("b", None)).await.unwrap();

        let sent = broker.sent().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].topic, "a");
    }

    #[tokio::test]
    async fn failing_broker_rejects_without_recording() {
        let broker = InMemoryBroker::new();
        broker.set_failing(true).await;

        assert!(broker.publish(request("a", None)).await.is_err());
        assert!(broker.sent().await.is_empty());
    }

    #[tokio::test]
    async fn stalled_publish_resumes_on_release() {
        let broker = InMemoryBroker::new();
        broker.stall_partition("slow").await;

        let publishing = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.publish(request("a", Some("slow"))).await })
        };

        tokio::task::yield_now().await;
        assert!(broker.sent().await.is_empty());

        broker.release_stalled().await;
        publishing.await.unwrap().unwrap();
        assert_eq!(broker.sent().await.len(), 1);
    }
}
