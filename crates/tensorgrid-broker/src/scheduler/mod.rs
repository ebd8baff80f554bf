//! The per-job state machine: consume submissions, match providers,
//! reserve funds, dispatch, track status, finalize.
//!
//! A pool of workers pulls from the durable submission queue; every state
//! transition is persisted before the corresponding bus acknowledgment, so
//! a crash at any point redelivers into an idempotent pipeline.

pub mod pipeline;
pub mod ranking;
pub mod recovery;
pub mod status;

use crate::billing::{BillingEngine, BillingEventReceiver};
use crate::bus::MessageBus;
use crate::config::BrokerConfig;
use crate::directory::ProviderDirectory;
use crate::storage::Store;
use ranking::CandidateRanking;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Scheduler {
    store: Arc<Store>,
    bus: MessageBus,
    directory: Arc<ProviderDirectory>,
    billing: Arc<BillingEngine>,
    config: BrokerConfig,
    ranking: CandidateRanking,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        bus: MessageBus,
        directory: Arc<ProviderDirectory>,
        billing: Arc<BillingEngine>,
        config: BrokerConfig,
    ) -> Arc<Self> {
        let mut hasher = DefaultHasher::new();
        config.service.service_id.hash(&mut hasher);
        let seed = hasher.finish();

        Arc::new(Self {
            store,
            bus,
            directory,
            billing,
            config,
            ranking: CandidateRanking::new(seed),
        })
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub(crate) fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub(crate) fn directory(&self) -> &Arc<ProviderDirectory> {
        &self.directory
    }

    pub(crate) fn billing(&self) -> &Arc<BillingEngine> {
        &self.billing
    }

    pub(crate) fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn ranking(&self) -> &CandidateRanking {
        &self.ranking
    }

    /// Start the worker pool, the status consumer, and the watchdog.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for worker in 0..self.config.scheduler.max_workers {
            let scheduler = Arc::clone(&self);
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                scheduler.worker_loop(worker, token).await;
            }));
        }

        handles.push(Arc::clone(&self).spawn_status_consumer(shutdown.clone()));
        handles.push(self.spawn_watchdog(shutdown));
        handles
    }

    /// Fetch and process one batch synchronously. Returns how many
    /// submissions were handled.
    pub async fn run_once(&self, consumer: &str) -> crate::error::Result<usize> {
        let deliveries = self
            .bus
            .fetch_submissions(consumer, self.config.bus.fetch_batch_size)
            .await?;
        let count = deliveries.len();
        for delivery in deliveries {
            self.process_delivery(delivery).await?;
        }
        Ok(count)
    }

    async fn worker_loop(self: Arc<Self>, worker: usize, shutdown: CancellationToken) {
        let consumer = format!("scheduler-{worker}");
        info!(worker = %consumer, "scheduler worker started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let deliveries = match self
                .bus
                .fetch_submissions(&consumer, self.config.bus.fetch_batch_size)
                .await
            {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    error!(worker = %consumer, error = %e, "submission fetch failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.fetch_interval()) => continue,
                    }
                }
            };

            if deliveries.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.fetch_interval()) => continue,
                }
            }

            for delivery in deliveries {
                if shutdown.is_cancelled() {
                    // Drain: hand claimed-but-unprocessed submissions back
                    if let Err(e) = delivery.nak(chrono::Duration::zero()).await {
                        error!(worker = %consumer, error = %e, "drain nak failed");
                    }
                    continue;
                }

                if let Err(e) = self.process_delivery(delivery).await {
                    error!(worker = %consumer, error = %e, "submission processing failed");
                }
            }
        }

        debug!(worker = %consumer, "scheduler worker stopped");
    }

    /// Consume billing-engine notifications: exhaustion or external
    /// cancellation terminating a session the scheduler still tracks.
    pub fn spawn_billing_events(
        self: Arc<Self>,
        mut events: BillingEventReceiver,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let scheduler = self;
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                if let Err(e) = scheduler.handle_billing_event(event).await {
                    error!(error = %e, "billing event handling failed");
                }
            }
            debug!("billing event consumer stopped");
        })
    }
}
