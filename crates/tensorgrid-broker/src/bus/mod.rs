//! Ordered durable delivery of job submissions, and fan-out pub/sub for
//! dispatch, status, and usage streams.
//!
//! Submissions ride a SQLite-backed queue with explicit per-message
//! acknowledgment and a bounded redelivery window; they survive restarts.
//! Dispatch, status, and usage are in-process subject streams. Exactly-once
//! is not promised anywhere; consumers are idempotent.

pub mod pubsub;

use crate::error::{BrokerError, Result};
use crate::storage::Store;
use chrono::Duration;
use pubsub::{BusMessage, PubSub, Subscription};
use std::sync::Arc;
use tensorgrid_protocol::subjects;

/// One delivered submission. The consumer must `ack` or `nak` it; a
/// consumer that drops the delivery without either loses its claim after
/// the ack-wait window and the message redelivers.
#[derive(Debug)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub attempts: u32,
    message_id: i64,
    store: Arc<Store>,
}

impl Delivery {
    /// Remove the message from delivery.
    pub async fn ack(self) -> Result<()> {
        self.store.ack_message(self.message_id).await
    }

    /// Return the message for redelivery after `delay`.
    pub async fn nak(self, delay: Duration) -> Result<()> {
        self.store.nak_message(self.message_id, delay).await
    }
}

/// The bus fabric: durable submissions plus subject pub/sub.
#[derive(Clone)]
pub struct MessageBus {
    store: Arc<Store>,
    pubsub: PubSub,
    ack_wait: Duration,
}

impl MessageBus {
    pub fn new(store: Arc<Store>, ack_wait: Duration) -> Self {
        Self {
            store,
            pubsub: PubSub::new(),
            ack_wait,
        }
    }

    /// Durably publish a job submission. At-least-once; retained across
    /// consumer restarts.
    pub async fn publish_submission(&self, payload: &[u8]) -> Result<()> {
        self.store
            .enqueue_message(subjects::JOBS_SUBMITTED, payload)
            .await?;
        Ok(())
    }

    /// Pull up to `batch` deliverable submissions for a queue-group member.
    /// Members of the same group load-balance: each message is claimed by
    /// one consumer at a time.
    pub async fn fetch_submissions(&self, consumer: &str, batch: i64) -> Result<Vec<Delivery>> {
        let messages = self
            .store
            .claim_messages(subjects::JOBS_SUBMITTED, consumer, batch, self.ack_wait)
            .await?;

        Ok(messages
            .into_iter()
            .map(|m| Delivery {
                payload: m.payload,
                attempts: m.attempts,
                message_id: m.id,
                store: self.store.clone(),
            })
            .collect())
    }

    pub async fn pending_submissions(&self) -> Result<usize> {
        self.store
            .pending_message_count(subjects::JOBS_SUBMITTED)
            .await
    }

    /// Fire a task descriptor at a provider's dispatch subject.
    /// Best-effort: no listening subscriber surfaces as a bus error, which
    /// the scheduler treats as a dispatch failure.
    pub async fn publish_dispatch(
        &self,
        provider_id: &str,
        job_id: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        let subject = subjects::dispatch(provider_id, job_id);
        let delivered = self.pubsub.publish(&subject, payload).await;
        if delivered == 0 {
            return Err(BrokerError::Bus {
                operation: "publish_dispatch".to_string(),
                message: format!("no subscriber on {subject}"),
            });
        }
        Ok(())
    }

    /// Status updates the scheduler consumes to advance job state.
    pub async fn publish_status(&self, job_id: &str, payload: Vec<u8>) -> Result<()> {
        self.pubsub
            .publish(&subjects::status(job_id), payload)
            .await;
        Ok(())
    }

    /// Usage samples the billing engine folds into session accrual.
    pub async fn publish_usage(&self, session_id: &str, payload: Vec<u8>) -> Result<()> {
        self.pubsub
            .publish(&subjects::usage(session_id), payload)
            .await;
        Ok(())
    }

    /// Subscribe to every status update.
    pub async fn subscribe_status(&self) -> Subscription {
        self.pubsub.subscribe(subjects::status_scope()).await
    }

    /// Subscribe to usage samples. An empty scope receives every session.
    pub async fn subscribe_usage(&self) -> Subscription {
        self.pubsub.subscribe(subjects::usage_scope()).await
    }

    /// Subscribe to dispatches addressed to one provider. Providers (or
    /// their test doubles) use this to receive task descriptors.
    pub async fn subscribe_dispatch(&self, provider_id: &str) -> Subscription {
        self.pubsub
            .subscribe(subjects::dispatch_scope(provider_id))
            .await
    }

    /// Raw prefix subscription.
    pub async fn subscribe_prefix(&self, prefix: impl Into<String>) -> Subscription {
        self.pubsub.subscribe(prefix.into()).await
    }
}

pub use pubsub::BusMessage as Message;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn bus() -> MessageBus {
        let store = Arc::new(Store::in_memory().await.unwrap());
        MessageBus::new(store, Duration::seconds(60))
    }

    #[tokio::test]
    async fn test_submission_survives_and_load_balances() {
        let bus = bus().await;
        bus.publish_submission(b"a").await.unwrap();
        bus.publish_submission(b"b").await.unwrap();

        let first = bus.fetch_submissions("w0", 1).await.unwrap();
        let second = bus.fetch_submissions("w1", 1).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        // Each member claimed a different message
        assert_ne!(first[0].payload, second[0].payload);
    }

    #[tokio::test]
    async fn test_dispatch_without_subscriber_is_an_error() {
        let bus = bus().await;
        let err = bus
            .publish_dispatch("prov-1", "job-1", b"task".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Bus { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_provider_scope() {
        let bus = bus().await;
        let mut sub = bus.subscribe_dispatch("prov-1").await;

        bus.publish_dispatch("prov-1", "job-1", b"task".to_vec())
            .await
            .unwrap();

        let BusMessage { subject, payload } = sub.recv().await.unwrap();
        assert_eq!(subject, "tasks.dispatch.prov-1.job-1");
        assert_eq!(payload, b"task");
    }

    #[tokio::test]
    async fn test_status_fans_out_to_scope_subscribers() {
        let bus = bus().await;
        let mut sub = bus.subscribe_status().await;

        bus.publish_status("job-9", b"update".to_vec()).await.unwrap();

        let message = sub.recv().await.unwrap();
        assert_eq!(message.subject, "task.status.job-9");
    }
}
