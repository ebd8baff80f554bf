//! In-process subject fan-out.
//!
//! Subscriptions are prefix-scoped: a subscriber on `task.status.` receives
//! every job's status stream. Each subscriber owns a bounded channel;
//! subscribers that fall away are pruned on the next publish to a matching
//! subject.

use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

const SUBSCRIBER_BUFFER: usize = 1024;

/// One published message.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

struct Subscriber {
    prefix: String,
    sender: mpsc::Sender<BusMessage>,
}

/// Subject registry shared by every bus handle.
#[derive(Clone)]
pub struct PubSub {
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

/// Receiving half of a prefix subscription. Dropping it unsubscribes.
pub struct Subscription {
    receiver: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }
}

impl PubSub {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn subscribe(&self, prefix: String) -> Subscription {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers
            .write()
            .await
            .push(Subscriber { prefix, sender });
        Subscription { receiver }
    }

    /// Deliver to every live subscriber whose prefix matches the subject.
    /// Returns how many subscribers received the message.
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> usize {
        let matching: Vec<mpsc::Sender<BusMessage>> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .filter(|s| subject.starts_with(&s.prefix))
                .map(|s| s.sender.clone())
                .collect()
        };

        let message = BusMessage {
            subject: subject.to_string(),
            payload,
        };

        let mut delivered = 0;
        let mut any_closed = false;
        for sender in matching {
            match sender.send(message.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) => any_closed = true,
            }
        }

        if any_closed {
            self.subscribers
                .write()
                .await
                .retain(|s| !s.sender.is_closed());
        }

        delivered
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}
