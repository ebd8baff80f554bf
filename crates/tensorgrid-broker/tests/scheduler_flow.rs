//! Scheduling flows: consume, match, reserve, dispatch, track, recover.

mod common;

use chrono::{Duration, Utc};
use common::*;
use pretty_assertions::assert_eq;
use rust_decimal_macros::dec;
use tensorgrid_broker::config::BrokerConfig;
use tensorgrid_broker::domain::{JobId, JobState, SessionStatus, WalletType};
use tensorgrid_protocol::{self as protocol, TaskDescriptor, TaskPhase, TaskStatusUpdate};

fn status_update(job_id: &str, phase: TaskPhase) -> TaskStatusUpdate {
    TaskStatusUpdate {
        job_id: job_id.to_string(),
        phase,
        progress_percent: 50,
        stage: Some("working".to_string()),
        message: None,
        exit_code: None,
        reported_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_submission_is_matched_reserved_and_dispatched() {
    let h = harness().await;
    fund_user(&h.store, "user-1", dec!(10)).await;
    h.registry.upsert(rtx4090_provider("prov-1", 0)).await;
    let mut dispatches = h.bus.subscribe_dispatch("prov-1").await;

    publish(&h.bus, &submission("job-1", "user-1", dec!(5.0))).await;
    assert_eq!(h.scheduler.run_once("w0").await.unwrap(), 1);

    // Job record advanced to Dispatched with the provider assigned
    let job = h
        .store
        .get_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Dispatched);
    assert_eq!(job.assigned_provider.as_ref().unwrap().as_str(), "prov-1");
    assert_eq!(job.attempts, 1);

    // Exactly one session exists for the dispatched job
    let session = h
        .store
        .get_session_by_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.gpu_model, "RTX 4090");

    // One hour reserved
    let (available, locked) = balances(&h.store, "user-1", WalletType::User).await;
    assert_eq!(available, dec!(8.57));
    assert_eq!(locked, dec!(1.43));

    // The provider received the full task descriptor
    let message = dispatches.recv().await.unwrap();
    let descriptor: TaskDescriptor = protocol::decode(&message.payload).unwrap();
    assert_eq!(descriptor.job_id, "job-1");
    assert_eq!(descriptor.session_id, session.id.to_string());
    assert_eq!(descriptor.cost_ceiling, dec!(5.0));
    assert_eq!(descriptor.max_duration_minutes, 120);

    // Submission was acked
    assert_eq!(h.bus.pending_submissions().await.unwrap(), 0);
}

#[tokio::test]
async fn test_redelivery_of_dispatched_job_is_acked_without_a_second_session() {
    let h = harness().await;
    fund_user(&h.store, "user-1", dec!(10)).await;
    h.registry.upsert(rtx4090_provider("prov-1", 0)).await;
    let _dispatches = h.bus.subscribe_dispatch("prov-1").await;

    let submission = submission("job-1", "user-1", dec!(5.0));
    publish(&h.bus, &submission).await;
    h.scheduler.run_once("w0").await.unwrap();

    // The same submission redelivers (at-least-once)
    publish(&h.bus, &submission).await;
    h.scheduler.run_once("w0").await.unwrap();

    let (_, locked) = balances(&h.store, "user-1", WalletType::User).await;
    assert_eq!(locked, dec!(1.43), "no double reservation");
    assert_eq!(h.bus.pending_submissions().await.unwrap(), 0);
}

#[tokio::test]
async fn test_malformed_submission_is_acked_as_poison() {
    let h = harness().await;
    h.bus.publish_submission(b"{not json").await.unwrap();

    assert_eq!(h.scheduler.run_once("w0").await.unwrap(), 1);
    assert_eq!(h.bus.pending_submissions().await.unwrap(), 0);
}

#[tokio::test]
async fn test_no_providers_naks_until_the_retry_ceiling() {
    let mut config = BrokerConfig::default();
    config.scheduler.retry_ceiling = 3;
    let h = harness_with(config).await;
    fund_user(&h.store, "user-1", dec!(10)).await;
    // Registry is empty: nothing can serve the job

    publish(&h.bus, &submission("job-1", "user-1", dec!(5.0))).await;

    for expected_attempts in 1..=2 {
        assert_eq!(h.scheduler.run_once("w0").await.unwrap(), 1);
        let job = h
            .store
            .get_job(&JobId::new("job-1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, expected_attempts);
        assert_eq!(h.bus.pending_submissions().await.unwrap(), 1);
    }

    // Third attempt reaches the ceiling: terminal failure, submission acked
    h.scheduler.run_once("w0").await.unwrap();
    let job = h
        .store
        .get_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.as_deref(), Some("no_capacity"));
    assert_eq!(h.bus.pending_submissions().await.unwrap(), 0);
}

#[tokio::test]
async fn test_insufficient_funds_fails_terminally() {
    let h = harness().await;
    fund_user(&h.store, "user-poor", dec!(0.5)).await;
    h.registry.upsert(rtx4090_provider("prov-1", 0)).await;
    let _dispatches = h.bus.subscribe_dispatch("prov-1").await;

    publish(&h.bus, &submission("job-1", "user-poor", dec!(5.0))).await;
    h.scheduler.run_once("w0").await.unwrap();

    let job = h
        .store
        .get_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.last_error.as_deref().unwrap().contains("Insufficient"));

    // Terminal failure acks; nothing stays locked
    assert_eq!(h.bus.pending_submissions().await.unwrap(), 0);
    let (available, locked) = balances(&h.store, "user-poor", WalletType::User).await;
    assert_eq!(available, dec!(0.5));
    assert_eq!(locked, dec!(0));
}

#[tokio::test]
async fn test_dispatch_failure_unwinds_and_retries_elsewhere() {
    let h = harness().await;
    fund_user(&h.store, "user-1", dec!(10)).await;
    // prov-a ranks first (lower load) but has no listener; prov-b does
    h.registry.upsert(rtx4090_provider("prov-a", 0)).await;
    h.registry.upsert(rtx4090_provider("prov-b", 5)).await;
    let mut dispatches_b = h.bus.subscribe_dispatch("prov-b").await;

    publish(&h.bus, &submission("job-1", "user-1", dec!(5.0))).await;
    h.scheduler.run_once("w0").await.unwrap();

    // Dispatch to prov-a failed: reservation unwound, attempt recorded
    let job = h
        .store
        .get_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.assigned_provider, None);
    assert!(job.attempts >= 1);
    let (available, locked) = balances(&h.store, "user-1", WalletType::User).await;
    assert_eq!(available, dec!(10));
    assert_eq!(locked, dec!(0));

    // Redelivery picks a different provider
    h.scheduler.run_once("w0").await.unwrap();
    let job = h
        .store
        .get_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Dispatched);
    assert_eq!(job.assigned_provider.as_ref().unwrap().as_str(), "prov-b");

    let message = dispatches_b.recv().await.unwrap();
    let descriptor: TaskDescriptor = protocol::decode(&message.payload).unwrap();
    assert_eq!(descriptor.job_id, "job-1");
}

#[tokio::test]
async fn test_status_stream_advances_job_to_completion() {
    let h = harness().await;
    fund_user(&h.store, "user-1", dec!(10)).await;
    h.registry.upsert(rtx4090_provider("prov-1", 0)).await;
    let _dispatches = h.bus.subscribe_dispatch("prov-1").await;

    publish(&h.bus, &submission("job-1", "user-1", dec!(5.0))).await;
    h.scheduler.run_once("w0").await.unwrap();

    h.scheduler
        .handle_status(status_update("job-1", TaskPhase::Running))
        .await
        .unwrap();
    let job = h
        .store
        .get_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Running);
    assert_eq!(job.progress_percent, 50);
    assert_eq!(job.stage.as_deref(), Some("working"));

    h.scheduler
        .handle_status(status_update("job-1", TaskPhase::Completed))
        .await
        .unwrap();
    let job = h
        .store
        .get_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Completed);

    // Completion settled the session gracefully
    let session = h
        .store
        .get_session_by_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    let (_, locked) = balances(&h.store, "user-1", WalletType::User).await;
    assert_eq!(locked, dec!(0));
}

#[tokio::test]
async fn test_terminal_job_ignores_late_status() {
    let h = harness().await;
    fund_user(&h.store, "user-1", dec!(10)).await;
    h.registry.upsert(rtx4090_provider("prov-1", 0)).await;
    let _dispatches = h.bus.subscribe_dispatch("prov-1").await;

    publish(&h.bus, &submission("job-1", "user-1", dec!(5.0))).await;
    h.scheduler.run_once("w0").await.unwrap();
    h.scheduler
        .handle_status(status_update("job-1", TaskPhase::Completed))
        .await
        .unwrap();

    // A straggling Running update cannot resurrect a terminal job
    h.scheduler
        .handle_status(status_update("job-1", TaskPhase::Running))
        .await
        .unwrap();
    let job = h
        .store
        .get_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Completed);
}

#[tokio::test]
async fn test_user_cancel_settles_and_notifies_provider() {
    let h = harness().await;
    fund_user(&h.store, "user-1", dec!(10)).await;
    h.registry.upsert(rtx4090_provider("prov-1", 0)).await;
    let mut dispatches = h.bus.subscribe_dispatch("prov-1").await;

    publish(&h.bus, &submission("job-1", "user-1", dec!(5.0))).await;
    h.scheduler.run_once("w0").await.unwrap();
    let _descriptor = dispatches.recv().await.unwrap();

    h.scheduler
        .cancel_job(&JobId::new("job-1"), "user_cancel")
        .await
        .unwrap();

    let job = h
        .store
        .get_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Cancelled);

    let session = h
        .store
        .get_session_by_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Cancelled);

    // Nothing accrued, so the reservation came back in full
    let (available, locked) = balances(&h.store, "user-1", WalletType::User).await;
    assert_eq!(available, dec!(10));
    assert_eq!(locked, dec!(0));

    // The provider got the cancellation directive
    let message = dispatches.recv().await.unwrap();
    let directive: protocol::CancelDirective = protocol::decode(&message.payload).unwrap();
    assert_eq!(directive.job_id, "job-1");
    assert_eq!(directive.reason, "user_cancel");
}

#[tokio::test]
async fn test_restart_recovery_republishes_only_retryable_jobs() {
    let h = harness().await;
    fund_user(&h.store, "user-1", dec!(10)).await;
    h.registry.upsert(rtx4090_provider("prov-1", 0)).await;
    let _dispatches = h.bus.subscribe_dispatch("prov-1").await;

    // J1 pending (never scheduled), J2 dispatched, J3 running
    use tensorgrid_broker::domain::Job;
    let j1 = Job::from_submission(submission("j1", "user-1", dec!(5.0)));
    h.store.save_job(&j1).await.unwrap();

    publish(&h.bus, &submission("j2", "user-1", dec!(5.0))).await;
    h.scheduler.run_once("w0").await.unwrap();

    publish(&h.bus, &submission("j3", "user-1", dec!(5.0))).await;
    h.scheduler.run_once("w0").await.unwrap();
    h.scheduler
        .handle_status(status_update("j3", TaskPhase::Running))
        .await
        .unwrap();

    // Restart sweep
    let recovered = h.scheduler.recover().await.unwrap();
    assert_eq!(recovered, 1, "only the pending job is republished");

    // In-flight jobs are untouched
    assert_eq!(
        h.store.get_job(&JobId::new("j2")).await.unwrap().unwrap().state,
        JobState::Dispatched
    );
    assert_eq!(
        h.store.get_job(&JobId::new("j3")).await.unwrap().unwrap().state,
        JobState::Running
    );

    // The republished job schedules normally
    h.scheduler.run_once("w0").await.unwrap();
    assert_eq!(
        h.store.get_job(&JobId::new("j1")).await.unwrap().unwrap().state,
        JobState::Dispatched
    );
}

#[tokio::test]
async fn test_watchdog_fails_stuck_jobs_and_settles_their_sessions() {
    let h = harness().await;
    fund_user(&h.store, "user-1", dec!(10)).await;
    h.registry.upsert(rtx4090_provider("prov-1", 0)).await;
    let _dispatches = h.bus.subscribe_dispatch("prov-1").await;

    publish(&h.bus, &submission("job-1", "user-1", dec!(5.0))).await;
    h.scheduler.run_once("w0").await.unwrap();

    // Age the job past its max-duration window
    let mut job = h
        .store
        .get_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    job.updated_at = Utc::now() - Duration::minutes(job.max_duration_minutes as i64 + 10);
    h.store.save_job(&job).await.unwrap();

    let failed = h.scheduler.watchdog_pass().await.unwrap();
    assert_eq!(failed, 1);

    let job = h
        .store
        .get_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Failed);

    let session = h
        .store
        .get_session_by_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert!(session.status.is_terminal());
    let (_, locked) = balances(&h.store, "user-1", WalletType::User).await;
    assert_eq!(locked, dec!(0));
}

#[tokio::test]
async fn test_provider_failure_is_terminal_and_not_replayed() {
    let h = harness().await;
    fund_user(&h.store, "user-1", dec!(10)).await;
    h.registry.upsert(rtx4090_provider("prov-1", 0)).await;
    let _dispatches = h.bus.subscribe_dispatch("prov-1").await;

    publish(&h.bus, &submission("job-1", "user-1", dec!(5.0))).await;
    h.scheduler.run_once("w0").await.unwrap();

    let mut update = status_update("job-1", TaskPhase::Failed);
    update.message = Some("CUDA out of memory".to_string());
    h.scheduler.handle_status(update).await.unwrap();

    let job = h
        .store
        .get_job(&JobId::new("job-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.as_deref(), Some("CUDA out of memory"));

    // Execution failures are outcomes, not scheduling noise: the restart
    // sweep leaves them alone
    let recovered = h.scheduler.recover().await.unwrap();
    assert_eq!(recovered, 0);
}
