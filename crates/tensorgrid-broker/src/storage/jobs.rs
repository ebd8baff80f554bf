use crate::domain::{Job, JobId, JobState, ProviderId, TokenAmount, UserId};
use crate::error::{BrokerError, Result};
use crate::storage::Store;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;

impl Store {
    /// Upsert a job record, keyed by the caller-supplied job id.
    pub async fn save_job(&self, job: &Job) -> Result<()> {
        let requirements = serde_json::to_string(&job.requirements)
            .map_err(|e| BrokerError::validation("requirements", e.to_string()))?;
        let execution = serde_json::to_string(&job.execution)
            .map_err(|e| BrokerError::validation("execution", e.to_string()))?;
        let input_files = serde_json::to_string(&job.input_files)
            .map_err(|e| BrokerError::validation("input_files", e.to_string()))?;
        let output_files = serde_json::to_string(&job.output_files)
            .map_err(|e| BrokerError::validation("output_files", e.to_string()))?;
        let metadata = serde_json::to_string(&job.metadata)
            .map_err(|e| BrokerError::validation("metadata", e.to_string()))?;
        let attempted = serde_json::to_string(&job.attempted_providers)
            .map_err(|e| BrokerError::validation("attempted_providers", e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO jobs
            (job_id, user_id, state, requirements, execution, cost_ceiling,
             max_duration_minutes, priority, input_files, output_files, metadata,
             last_error, attempts, assigned_provider, attempted_providers,
             progress_percent, stage, submitted_at, received_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            ON CONFLICT(job_id) DO UPDATE SET
                state = excluded.state,
                last_error = excluded.last_error,
                attempts = excluded.attempts,
                assigned_provider = excluded.assigned_provider,
                attempted_providers = excluded.attempted_providers,
                progress_percent = excluded.progress_percent,
                stage = excluded.stage,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(job.id.as_str())
        .bind(job.user_id.as_str())
        .bind(job.state.to_string())
        .bind(requirements)
        .bind(execution)
        .bind(job.cost_ceiling.persisted().to_string())
        .bind(job.max_duration_minutes as i64)
        .bind(job.priority as i64)
        .bind(input_files)
        .bind(output_files)
        .bind(metadata)
        .bind(&job.last_error)
        .bind(job.attempts as i64)
        .bind(job.assigned_provider.as_ref().map(|p| p.to_string()))
        .bind(attempted)
        .bind(job.progress_percent as i64)
        .bind(&job.stage)
        .bind(job.submitted_at)
        .bind(job.received_at)
        .bind(job.updated_at)
        .execute(self.pool())
        .await
        .map_err(|e| BrokerError::database("save_job", e))?;

        Ok(())
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?1")
            .bind(id.as_str())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| BrokerError::database("get_job", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Narrow update of the scheduling-state columns.
    pub async fn update_job_state(
        &self,
        id: &JobId,
        state: JobState,
        provider: Option<&ProviderId>,
        last_error: Option<&str>,
        attempts: u32,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?2, assigned_provider = ?3, last_error = ?4, attempts = ?5, updated_at = ?6
            WHERE job_id = ?1
            "#,
        )
        .bind(id.as_str())
        .bind(state.to_string())
        .bind(provider.map(|p| p.to_string()))
        .bind(last_error)
        .bind(attempts as i64)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| BrokerError::database("update_job_state", e))?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound {
                entity: "job",
                id: id.to_string(),
            });
        }

        Ok(())
    }

    pub async fn get_jobs_by_state(&self, state: JobState, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE state = ?1 ORDER BY updated_at ASC LIMIT ?2",
        )
        .bind(state.to_string())
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::database("get_jobs_by_state", e))?;

        rows.iter().map(job_from_row).collect()
    }

    /// Jobs the restart sweep re-enqueues: non-dispatched, non-terminal
    /// states plus failures still below the retry ceiling.
    pub async fn get_retryable_jobs(&self, retry_ceiling: u32, limit: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE state IN ('pending', 'searching')
               OR (state = 'failed' AND attempts < ?1)
            ORDER BY updated_at ASC
            LIMIT ?2
            "#,
        )
        .bind(retry_ceiling as i64)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::database("get_retryable_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    /// In-flight jobs whose last update is older than the cutoff; input to
    /// the stuck-job watchdog.
    pub async fn get_inflight_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE state IN ('dispatched', 'running') AND updated_at < ?1
            ORDER BY updated_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::database("get_inflight_jobs_before", e))?;

        rows.iter().map(job_from_row).collect()
    }
}

fn job_from_row(r: &SqliteRow) -> Result<Job> {
    let state_str: String = r.get("state");
    let state = JobState::from_str(&state_str)
        .map_err(|e| BrokerError::validation("state", e))?;

    let cost_ceiling: String = r.get("cost_ceiling");
    let cost_ceiling = Decimal::from_str(&cost_ceiling)
        .map_err(|e| BrokerError::validation("cost_ceiling", e.to_string()))?;

    let requirements: String = r.get("requirements");
    let execution: String = r.get("execution");
    let input_files: String = r.get("input_files");
    let output_files: String = r.get("output_files");
    let metadata: String = r.get("metadata");
    let attempted: String = r.get("attempted_providers");

    Ok(Job {
        id: JobId::new(r.get::<String, _>("job_id")),
        user_id: UserId::new(r.get::<String, _>("user_id")),
        requirements: serde_json::from_str(&requirements)
            .map_err(|e| BrokerError::validation("requirements", e.to_string()))?,
        execution: serde_json::from_str(&execution)
            .map_err(|e| BrokerError::validation("execution", e.to_string()))?,
        cost_ceiling: TokenAmount::from_decimal(cost_ceiling),
        max_duration_minutes: r.get::<i64, _>("max_duration_minutes") as u32,
        priority: r.get::<i64, _>("priority") as i32,
        input_files: serde_json::from_str(&input_files).unwrap_or_default(),
        output_files: serde_json::from_str(&output_files).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        state,
        last_error: r.get("last_error"),
        attempts: r.get::<i64, _>("attempts") as u32,
        assigned_provider: r
            .get::<Option<String>, _>("assigned_provider")
            .map(ProviderId::new),
        attempted_providers: serde_json::from_str(&attempted).unwrap_or_default(),
        progress_percent: r.get::<i64, _>("progress_percent") as u8,
        stage: r.get("stage"),
        submitted_at: r.get("submitted_at"),
        received_at: r.get("received_at"),
        updated_at: r.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::submission_fixture;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_save_and_get_round_trip() {
        let store = Store::in_memory().await.unwrap();
        let job = Job::from_submission(submission_fixture());

        store.save_job(&job).await.unwrap();
        let loaded = store.get_job(&job.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.state, JobState::Pending);
        assert_eq!(loaded.requirements, job.requirements);
        assert_eq!(loaded.execution, job.execution);
        assert_eq!(loaded.cost_ceiling, job.cost_ceiling);
    }

    #[tokio::test]
    async fn test_upsert_is_keyed_by_job_id() {
        let store = Store::in_memory().await.unwrap();
        let mut job = Job::from_submission(submission_fixture());
        store.save_job(&job).await.unwrap();

        job.transition_to(JobState::Searching).unwrap();
        job.record_failure("no provider");
        store.save_job(&job).await.unwrap();

        let loaded = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, JobState::Searching);
        assert_eq!(loaded.attempts, 1);

        let pending = store.get_jobs_by_state(JobState::Pending, 10).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_update_job_state_missing_job_is_not_found() {
        let store = Store::in_memory().await.unwrap();
        let err = store
            .update_job_state(&JobId::new("nope"), JobState::Failed, None, None, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_retryable_sweep_excludes_exhausted_failures() {
        let store = Store::in_memory().await.unwrap();

        let mut pending = Job::from_submission(submission_fixture());
        pending.id = JobId::new("job-pending");
        store.save_job(&pending).await.unwrap();

        let mut failed_low = Job::from_submission(submission_fixture());
        failed_low.id = JobId::new("job-failed-low");
        failed_low.state = JobState::Failed;
        failed_low.attempts = 1;
        store.save_job(&failed_low).await.unwrap();

        let mut failed_out = Job::from_submission(submission_fixture());
        failed_out.id = JobId::new("job-failed-out");
        failed_out.state = JobState::Failed;
        failed_out.attempts = 5;
        store.save_job(&failed_out).await.unwrap();

        let mut running = Job::from_submission(submission_fixture());
        running.id = JobId::new("job-running");
        running.state = JobState::Running;
        store.save_job(&running).await.unwrap();

        let retryable = store.get_retryable_jobs(5, 10).await.unwrap();
        let ids: Vec<&str> = retryable.iter().map(|j| j.id.as_str()).collect();
        assert!(ids.contains(&"job-pending"));
        assert!(ids.contains(&"job-failed-low"));
        assert!(!ids.contains(&"job-failed-out"));
        assert!(!ids.contains(&"job-running"));
    }
}
