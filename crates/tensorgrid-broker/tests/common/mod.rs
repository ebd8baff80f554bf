#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tensorgrid_broker::billing::{
    billing_event_channel, BillingEngine, BillingEventReceiver, LocalSettlement,
    StartSessionRequest,
};
use tensorgrid_broker::bus::MessageBus;
use tensorgrid_broker::config::BrokerConfig;
use tensorgrid_broker::directory::registry::{RegistryClient, StaticRegistry};
use tensorgrid_broker::directory::ProviderDirectory;
use tensorgrid_broker::domain::{
    GpuDevice, Provider, ProviderId, ProviderStatus, TokenAmount, UserId, Wallet, WalletType,
};
use tensorgrid_broker::pricing::PricingEngine;
use tensorgrid_broker::scheduler::Scheduler;
use tensorgrid_broker::storage::Store;
use tensorgrid_common::LocationTag;
use tensorgrid_protocol::{
    ExecutionPayload, JobSubmission, ResourceRequirements, UsageReport,
};
use uuid::Uuid;

pub struct Harness {
    pub config: BrokerConfig,
    pub store: Arc<Store>,
    pub bus: MessageBus,
    pub registry: Arc<StaticRegistry>,
    pub billing: Arc<BillingEngine>,
    pub scheduler: Arc<Scheduler>,
    pub billing_events: BillingEventReceiver,
}

pub async fn harness() -> Harness {
    harness_with(BrokerConfig::default()).await
}

pub async fn harness_with(mut config: BrokerConfig) -> Harness {
    // Immediate redelivery keeps test flows deterministic
    config.scheduler.registry_error_delay_seconds = 0;
    config.scheduler.no_provider_delay_seconds = 0;
    config.scheduler.store_error_delay_seconds = 0;

    let store = Arc::new(Store::in_memory().await.expect("in-memory store"));
    let bus = MessageBus::new(store.clone(), config.ack_wait());
    let registry = StaticRegistry::new();
    let registry_client: Arc<dyn RegistryClient> = registry.clone();
    let directory = Arc::new(ProviderDirectory::new(
        registry_client,
        config.directory_cache_ttl(),
    ));
    let pricing = Arc::new(PricingEngine::new(config.pricing.clone()));

    let (events_tx, billing_events) = billing_event_channel(64);
    let billing = Arc::new(BillingEngine::new(
        store.clone(),
        pricing,
        Arc::new(LocalSettlement),
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

    Harness {
        config,
        store,
        bus,
        registry,
        billing,
        scheduler,
        billing_events,
    }
}

pub async fn fund_user(store: &Store, user: &str, amount: Decimal) -> Wallet {
    let mut wallet = Wallet::new(user, WalletType::User, format!("user:{user}"));
    wallet.credit(TokenAmount::from_decimal(amount));
    store.create_wallet(&wallet).await.expect("create wallet");
    wallet
}

pub async fn balances(store: &Store, owner: &str, wallet_type: WalletType) -> (Decimal, Decimal) {
    let wallet = store
        .get_wallet_by_owner(owner, wallet_type)
        .await
        .expect("wallet lookup")
        .expect("wallet exists");
    (wallet.available.as_decimal(), wallet.locked.as_decimal())
}

pub fn rtx4090_provider(id: &str, load: u32) -> Provider {
    Provider {
        id: ProviderId::new(id),
        display_name: format!("host {id}"),
        location: "Helsinki/Uusimaa/FI".parse::<LocationTag>().unwrap(),
        status: ProviderStatus::Idle,
        gpus: vec![GpuDevice {
            model: "RTX 4090".to_string(),
            vram_mb: 24_576,
            healthy: true,
            power_estimate_w: 450,
        }],
        current_load: load,
        last_seen_at: Utc::now(),
    }
}

pub fn submission(job_id: &str, user: &str, cost_ceiling: Decimal) -> JobSubmission {
    JobSubmission {
        job_id: job_id.to_string(),
        user_id: user.to_string(),
        requirements: ResourceRequirements {
            gpu_model: Some("RTX 4090".to_string()),
            min_vram_mb: 24_576,
            gpu_count: 1,
            cpu_cores: 8,
            memory_mb: 32_768,
            estimated_power_w: 450,
        },
        execution: ExecutionPayload::Container {
            image: "pytorch/pytorch:latest".to_string(),
            command: vec!["python".to_string(), "train.py".to_string()],
            env: HashMap::new(),
            volume_mounts: vec![],
            gpu_access: true,
        },
        cost_ceiling,
        max_duration_minutes: 120,
        priority: 0,
        input_files: vec![],
        output_files: vec![],
        submitted_at: Utc::now(),
        metadata: HashMap::new(),
    }
}

pub async fn publish(bus: &MessageBus, submission: &JobSubmission) {
    let payload = tensorgrid_protocol::encode(submission).expect("encode submission");
    bus.publish_submission(&payload).await.expect("publish");
}

pub async fn open_session(
    billing: &BillingEngine,
    user: &str,
    provider: &str,
    cost_ceiling: Decimal,
) -> tensorgrid_broker::billing::SessionReceipt {
    billing
        .start_session(StartSessionRequest {
            user_id: UserId::new(user),
            provider_id: ProviderId::new(provider),
            job_id: None,
            gpu_model: "RTX 4090".to_string(),
            allocated_vram_mb: 24_576,
            total_vram_mb: 24_576,
            estimated_power_w: 450,
            cost_ceiling: TokenAmount::from_decimal(cost_ceiling),
            provider_rates: None,
        })
        .await
        .expect("start session")
}

pub fn usage_report(
    session_id: &str,
    period_minutes: f64,
    power_w: f64,
    recorded_at: DateTime<Utc>,
) -> UsageReport {
    UsageReport {
        sample_id: Uuid::new_v4(),
        session_id: session_id.to_string(),
        recorded_at,
        gpu_utilization_percent: 97.0,
        vram_utilization_percent: 88.0,
        power_draw_w: power_w,
        temperature_c: 70.0,
        period_minutes,
    }
}

pub fn minutes_after(start: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
    start + Duration::minutes(minutes)
}
