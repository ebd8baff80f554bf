//! Service wiring: construct the component graph, run recovery sweeps,
//! and drive the worker pools until shutdown.

use crate::billing::{
    billing_event_channel, BillingEngine, LocalSettlement, SettlementService,
};
use crate::bus::MessageBus;
use crate::config::BrokerConfig;
use crate::directory::registry::{HttpRegistryClient, RegistryClient};
use crate::directory::ProviderDirectory;
use crate::pricing::PricingEngine;
use crate::scheduler::Scheduler;
use crate::storage::Store;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct BrokerServer {
    config: BrokerConfig,
    store: Arc<Store>,
    bus: MessageBus,
    scheduler: Arc<Scheduler>,
    billing: Arc<BillingEngine>,
    billing_events: crate::billing::BillingEventReceiver,
}

impl BrokerServer {
    /// Build against the configured registry and the local settlement
    /// implementation.
    pub async fn new(config: BrokerConfig) -> anyhow::Result<Self> {
        let registry: Arc<dyn RegistryClient> = Arc::new(HttpRegistryClient::new(
            config.directory.registry_url.clone(),
            config.directory_timeout(),
        )?);
        Self::with_collaborators(config, registry, Arc::new(LocalSettlement)).await
    }

    /// Build with explicit collaborator implementations. Tests and
    /// single-node runs inject an in-memory registry here.
    pub async fn with_collaborators(
        config: BrokerConfig,
        registry: Arc<dyn RegistryClient>,
        settlement: Arc<dyn SettlementService>,
    ) -> anyhow::Result<Self> {
        let store = Arc::new(
            Store::connect(
                &config.database.path,
                config.database.max_connections,
                std::time::Duration::from_secs(config.database.call_timeout_seconds),
            )
            .await?,
        );
        let bus = MessageBus::new(store.clone(), config.ack_wait());
        let directory = Arc::new(ProviderDirectory::new(registry, config.directory_cache_ttl()));
        let pricing = Arc::new(PricingEngine::new(config.pricing.clone()));

        let (events_tx, events_rx) = billing_event_channel(1024);
        let billing = Arc::new(BillingEngine::new(
            store.clone(),
            pricing,
            settlement,
            config.billing.clone(),
            events_tx,
        ));

        let scheduler = Scheduler::new(
            store.clone(),
            bus.clone(),
            directory,
            billing.clone(),
            config.clone(),
        );

        Ok(Self {
            config,
            store,
            bus,
            scheduler,
            billing,
            billing_events: events_rx,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        self.store.run_migrations().await?;
        Ok(())
    }

    /// Run until the shutdown future resolves. Active sessions are left
    /// durable; they resume on the next start.
    pub async fn serve(self, shutdown_signal: impl Future<Output = ()>) -> anyhow::Result<()> {
        // Reconcile before accepting work: settle sessions stuck
        // mid-settle, then republish retryable jobs
        let reconciled = self.billing.reconcile_sessions().await?;
        if reconciled > 0 {
            info!(count = reconciled, "sessions reconciled at startup");
        }
        let recovered = self.scheduler.recover().await?;
        if recovered > 0 {
            info!(count = recovered, "jobs recovered at startup");
        }

        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        let usage_subscription = self.bus.subscribe_usage().await;
        handles.push(
            self.billing
                .clone()
                .spawn_usage_consumer(usage_subscription, shutdown.clone()),
        );
        handles.push(
            self.scheduler
                .clone()
                .spawn_billing_events(self.billing_events, shutdown.clone()),
        );
        handles.extend(self.scheduler.clone().spawn(shutdown.clone()));

        info!(
            workers = self.config.scheduler.max_workers,
            "broker running"
        );

        shutdown_signal.await;
        info!("shutdown signal received; draining");

        // Stop accepting new bus messages, drain in-flight submissions,
        // let active handlers finish, then close the store
        shutdown.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker join failed");
            }
        }
        self.store.close().await;

        info!("broker stopped");
        Ok(())
    }
}
