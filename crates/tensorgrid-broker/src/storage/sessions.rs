use crate::domain::{
    EndReason, JobId, ProviderId, RateCard, RentalSession, SessionId, SessionStatus, TokenAmount,
    UserId,
};
use crate::error::{BrokerError, Result};
use crate::storage::{Store, StoreTx};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;

impl Store {
    pub async fn create_session(&self, session: &RentalSession) -> Result<()> {
        let mut tx = self.begin().await?;
        self.create_session_tx(&mut tx, session).await?;
        tx.commit()
            .await
            .map_err(|e| BrokerError::database("create_session", e))?;
        Ok(())
    }

    pub async fn create_session_tx(
        &self,
        tx: &mut StoreTx<'_>,
        session: &RentalSession,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rental_sessions
            (session_id, user_id, provider_id, job_id, status,
             gpu_model, allocated_vram_mb, total_vram_mb, vram_percentage,
             estimated_power_w, actual_power_w,
             base_hourly, vram_per_gb_hour, power_per_kw_hour, platform_fee_percent,
             total_cost, platform_fee, provider_earnings, max_cost_ceiling, locked_funds,
             started_at, last_billed_at, ended_at, updated_at, end_reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                    ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.user_id.as_str())
        .bind(session.provider_id.as_str())
        .bind(session.job_id.as_ref().map(|j| j.to_string()))
        .bind(session.status.to_string())
        .bind(&session.gpu_model)
        .bind(session.allocated_vram_mb as i64)
        .bind(session.total_vram_mb as i64)
        .bind(session.vram_percentage.to_string())
        .bind(session.estimated_power_w as i64)
        .bind(session.actual_power_w.map(|w| w.to_string()))
        .bind(session.rates.base_hourly.to_string())
        .bind(session.rates.vram_per_gb_hour.to_string())
        .bind(session.rates.power_per_kw_hour.to_string())
        .bind(session.rates.platform_fee_percent.to_string())
        .bind(session.total_cost.persisted().to_string())
        .bind(session.platform_fee.persisted().to_string())
        .bind(session.provider_earnings.persisted().to_string())
        .bind(session.max_cost_ceiling.persisted().to_string())
        .bind(session.locked_funds.persisted().to_string())
        .bind(session.started_at)
        .bind(session.last_billed_at)
        .bind(session.ended_at)
        .bind(session.updated_at)
        .bind(session.end_reason.map(|r| r.to_string()))
        .execute(&mut **tx)
        .await
        .map_err(|e| BrokerError::database("create_session", e))?;

        Ok(())
    }

    pub async fn get_session(&self, id: &SessionId) -> Result<Option<RentalSession>> {
        let row = sqlx::query("SELECT * FROM rental_sessions WHERE session_id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| BrokerError::database("get_session", e))?;

        row.map(|r| session_from_row(&r)).transpose()
    }

    pub async fn get_session_by_job(&self, job_id: &JobId) -> Result<Option<RentalSession>> {
        let row = sqlx::query(
            "SELECT * FROM rental_sessions WHERE job_id = ?1 ORDER BY started_at DESC LIMIT 1",
        )
        .bind(job_id.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(|e| BrokerError::database("get_session_by_job", e))?;

        row.map(|r| session_from_row(&r)).transpose()
    }

    pub async fn update_session(&self, session: &RentalSession) -> Result<()> {
        let mut tx = self.begin().await?;
        self.update_session_tx(&mut tx, session).await?;
        tx.commit()
            .await
            .map_err(|e| BrokerError::database("update_session", e))?;
        Ok(())
    }

    pub async fn update_session_tx(
        &self,
        tx: &mut StoreTx<'_>,
        session: &RentalSession,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE rental_sessions
            SET status = ?2, actual_power_w = ?3, total_cost = ?4, platform_fee = ?5,
                provider_earnings = ?6, locked_funds = ?7, last_billed_at = ?8,
                ended_at = ?9, updated_at = ?10, end_reason = ?11
            WHERE session_id = ?1
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.status.to_string())
        .bind(session.actual_power_w.map(|w| w.to_string()))
        .bind(session.total_cost.persisted().to_string())
        .bind(session.platform_fee.persisted().to_string())
        .bind(session.provider_earnings.persisted().to_string())
        .bind(session.locked_funds.persisted().to_string())
        .bind(session.last_billed_at)
        .bind(session.ended_at)
        .bind(session.updated_at)
        .bind(session.end_reason.map(|r| r.to_string()))
        .execute(&mut **tx)
        .await
        .map_err(|e| BrokerError::database("update_session", e))?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound {
                entity: "session",
                id: session.id.to_string(),
            });
        }

        Ok(())
    }

    pub async fn get_active_sessions_by_user(&self, user_id: &UserId) -> Result<Vec<RentalSession>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM rental_sessions
            WHERE user_id = ?1 AND status IN ('active', 'suspended')
            ORDER BY started_at DESC
            "#,
        )
        .bind(user_id.as_str())
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::database("get_active_sessions_by_user", e))?;

        rows.iter().map(session_from_row).collect()
    }

    /// Every non-terminal session; input to the billing reconciliation sweep.
    pub async fn get_active_sessions(&self) -> Result<Vec<RentalSession>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM rental_sessions
            WHERE status IN ('active', 'suspended')
            ORDER BY started_at ASC
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::database("get_active_sessions", e))?;

        rows.iter().map(session_from_row).collect()
    }
}

fn decimal_column(r: &SqliteRow, column: &str) -> Result<Decimal> {
    let raw: String = r.get(column);
    Decimal::from_str(&raw).map_err(|e| BrokerError::validation(column.to_string(), e.to_string()))
}

fn session_from_row(r: &SqliteRow) -> Result<RentalSession> {
    let status: String = r.get("status");
    let status = SessionStatus::from_str(&status)
        .map_err(|e| BrokerError::validation("status", e))?;

    let session_id: String = r.get("session_id");
    let session_id = SessionId::from_str(&session_id)
        .map_err(|e| BrokerError::validation("session_id", e.to_string()))?;

    let end_reason = r
        .get::<Option<String>, _>("end_reason")
        .map(|raw| match raw.as_str() {
            "graceful" => Ok(EndReason::Graceful),
            "user_cancel" => Ok(EndReason::UserCancel),
            "funds" => Ok(EndReason::FundsExhausted),
            "ceiling" => Ok(EndReason::CeilingReached),
            "force" => Ok(EndReason::Forced),
            other => Err(BrokerError::validation(
                "end_reason",
                format!("unknown end reason '{other}'"),
            )),
        })
        .transpose()?;

    Ok(RentalSession {
        id: session_id,
        user_id: UserId::new(r.get::<String, _>("user_id")),
        provider_id: ProviderId::new(r.get::<String, _>("provider_id")),
        job_id: r.get::<Option<String>, _>("job_id").map(JobId::new),
        status,
        gpu_model: r.get("gpu_model"),
        allocated_vram_mb: r.get::<i64, _>("allocated_vram_mb") as u64,
        total_vram_mb: r.get::<i64, _>("total_vram_mb") as u64,
        vram_percentage: decimal_column(r, "vram_percentage")?,
        estimated_power_w: r.get::<i64, _>("estimated_power_w") as u32,
        actual_power_w: r
            .get::<Option<String>, _>("actual_power_w")
            .map(|raw| {
                Decimal::from_str(&raw)
                    .map_err(|e| BrokerError::validation("actual_power_w", e.to_string()))
            })
            .transpose()?,
        rates: RateCard {
            base_hourly: decimal_column(r, "base_hourly")?,
            vram_per_gb_hour: decimal_column(r, "vram_per_gb_hour")?,
            power_per_kw_hour: decimal_column(r, "power_per_kw_hour")?,
            platform_fee_percent: decimal_column(r, "platform_fee_percent")?,
        },
        total_cost: TokenAmount::from_decimal(decimal_column(r, "total_cost")?),
        platform_fee: TokenAmount::from_decimal(decimal_column(r, "platform_fee")?),
        provider_earnings: TokenAmount::from_decimal(decimal_column(r, "provider_earnings")?),
        max_cost_ceiling: TokenAmount::from_decimal(decimal_column(r, "max_cost_ceiling")?),
        locked_funds: TokenAmount::from_decimal(decimal_column(r, "locked_funds")?),
        started_at: r.get("started_at"),
        last_billed_at: r.get("last_billed_at"),
        ended_at: r.get("ended_at"),
        updated_at: r.get("updated_at"),
        end_reason,
    })
}

#[cfg(test)]
pub(crate) fn session_fixture(user: &str, provider: &str) -> RentalSession {
    use chrono::Utc;
    use rust_decimal_macros::dec;

    let now = Utc::now();
    RentalSession {
        id: SessionId::new(),
        user_id: UserId::new(user),
        provider_id: ProviderId::new(provider),
        job_id: Some(JobId::new("job-test")),
        status: SessionStatus::Active,
        gpu_model: "RTX 4090".to_string(),
        allocated_vram_mb: 24_576,
        total_vram_mb: 24_576,
        vram_percentage: dec!(100),
        estimated_power_w: 450,
        actual_power_w: None,
        rates: RateCard {
            base_hourly: dec!(0.5),
            vram_per_gb_hour: dec!(0.02),
            power_per_kw_hour: dec!(1.0),
            platform_fee_percent: dec!(5),
        },
        total_cost: TokenAmount::zero(),
        platform_fee: TokenAmount::zero(),
        provider_earnings: TokenAmount::zero(),
        max_cost_ceiling: TokenAmount::from_decimal(dec!(5.0)),
        locked_funds: TokenAmount::from_decimal(dec!(1.43)),
        started_at: now,
        last_billed_at: now,
        ended_at: None,
        updated_at: now,
        end_reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_session_round_trip() {
        let store = Store::in_memory().await.unwrap();
        let session = session_fixture("user-1", "prov-1");

        store.create_session(&session).await.unwrap();
        let loaded = store.get_session(&session.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(loaded.rates, session.rates);
        assert_eq!(loaded.locked_funds.as_decimal(), dec!(1.43));
        assert_eq!(loaded.end_reason, None);
    }

    #[tokio::test]
    async fn test_session_lookup_by_job() {
        let store = Store::in_memory().await.unwrap();
        let session = session_fixture("user-1", "prov-1");
        store.create_session(&session).await.unwrap();

        let loaded = store
            .get_session_by_job(&JobId::new("job-test"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.id, session.id);
    }

    #[tokio::test]
    async fn test_terminal_update_persists_reason() {
        let store = Store::in_memory().await.unwrap();
        let mut session = session_fixture("user-1", "prov-1");
        store.create_session(&session).await.unwrap();

        session.end_reason = Some(EndReason::CeilingReached);
        session.transition_to(SessionStatus::Terminated).unwrap();
        store.update_session(&session).await.unwrap();

        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Terminated);
        assert_eq!(loaded.end_reason, Some(EndReason::CeilingReached));
        assert!(loaded.ended_at.is_some());

        let active = store.get_active_sessions().await.unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_active_sessions_scoped_by_user() {
        let store = Store::in_memory().await.unwrap();
        let mut a = session_fixture("user-a", "prov-1");
        a.job_id = Some(JobId::new("job-a"));
        let mut b = session_fixture("user-b", "prov-2");
        b.job_id = Some(JobId::new("job-b"));
        store.create_session(&a).await.unwrap();
        store.create_session(&b).await.unwrap();

        let for_a = store
            .get_active_sessions_by_user(&UserId::new("user-a"))
            .await
            .unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].id, a.id);

        let all = store.get_active_sessions().await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
