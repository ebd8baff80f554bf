use crate::domain::{SessionId, TokenAmount, UsageSample};
use crate::error::{BrokerError, Result};
use crate::storage::Store;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

impl Store {
    /// Append a usage sample. Idempotent on the sample's own id: a replayed
    /// sample is ignored and the call reports that nothing was inserted.
    pub async fn append_usage(&self, sample: &UsageSample) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO usage_records
            (sample_id, session_id, recorded_at, gpu_utilization_percent,
             vram_utilization_percent, power_draw_w, temperature_c,
             period_minutes, period_cost)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(sample_id) DO NOTHING
            "#,
        )
        .bind(sample.id.to_string())
        .bind(sample.session_id.to_string())
        .bind(sample.recorded_at)
        .bind(sample.gpu_utilization_percent.to_string())
        .bind(sample.vram_utilization_percent.to_string())
        .bind(sample.power_draw_w.to_string())
        .bind(sample.temperature_c.to_string())
        .bind(sample.period_minutes.to_string())
        .bind(sample.period_cost.persisted().to_string())
        .execute(self.pool())
        .await
        .map_err(|e| BrokerError::database("append_usage", e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Samples for a session, ordered by recorded-at. The bus does not
    /// guarantee temporal order; this is where it is reconstructed.
    pub async fn get_usage_by_session(
        &self,
        session_id: &SessionId,
        limit: i64,
    ) -> Result<Vec<UsageSample>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM usage_records
            WHERE session_id = ?1
            ORDER BY recorded_at ASC
            LIMIT ?2
            "#,
        )
        .bind(session_id.to_string())
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::database("get_usage_by_session", e))?;

        rows.iter().map(sample_from_row).collect()
    }

    /// Sum of persisted period costs for a session.
    pub async fn sum_usage_costs(&self, session_id: &SessionId) -> Result<TokenAmount> {
        let rows = sqlx::query("SELECT period_cost FROM usage_records WHERE session_id = ?1")
            .bind(session_id.to_string())
            .fetch_all(self.pool())
            .await
            .map_err(|e| BrokerError::database("sum_usage_costs", e))?;

        let mut total = TokenAmount::zero();
        for row in rows {
            let raw: String = row.get("period_cost");
            let cost = Decimal::from_str(&raw)
                .map_err(|e| BrokerError::validation("period_cost", e.to_string()))?;
            total = total.add(TokenAmount::from_decimal(cost));
        }
        Ok(total)
    }

    /// Append an accrual audit row.
    pub async fn append_billing_record(
        &self,
        session_id: &SessionId,
        kind: &str,
        amount: TokenAmount,
        accrued_total: TokenAmount,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_records (session_id, kind, amount, accrued_total, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(session_id.to_string())
        .bind(kind)
        .bind(amount.persisted().to_string())
        .bind(accrued_total.persisted().to_string())
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| BrokerError::database("append_billing_record", e))?;

        Ok(())
    }
}

fn sample_from_row(r: &SqliteRow) -> Result<UsageSample> {
    let sample_id: String = r.get("sample_id");
    let sample_id = Uuid::from_str(&sample_id)
        .map_err(|e| BrokerError::validation("sample_id", e.to_string()))?;

    let session_id: String = r.get("session_id");
    let session_id = SessionId::from_str(&session_id)
        .map_err(|e| BrokerError::validation("session_id", e.to_string()))?;

    let decimal = |column: &str| -> Result<Decimal> {
        let raw: String = r.get(column);
        Decimal::from_str(&raw)
            .map_err(|e| BrokerError::validation(column.to_string(), e.to_string()))
    };

    Ok(UsageSample {
        id: sample_id,
        session_id,
        recorded_at: r.get::<DateTime<Utc>, _>("recorded_at"),
        gpu_utilization_percent: decimal("gpu_utilization_percent")?,
        vram_utilization_percent: decimal("vram_utilization_percent")?,
        power_draw_w: decimal("power_draw_w")?,
        temperature_c: decimal("temperature_c")?,
        period_minutes: decimal("period_minutes")?,
        period_cost: TokenAmount::from_decimal(decimal("period_cost")?),
    })
}
