use crate::domain::ProviderId;
use crate::error::{BrokerError, Result};
use crate::storage::Store;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;

impl Store {
    /// Per-provider base-rate overrides, keyed by GPU model. Empty when a
    /// provider carries no overrides.
    pub async fn get_provider_rates(
        &self,
        provider_id: &ProviderId,
    ) -> Result<HashMap<String, Decimal>> {
        let rows = sqlx::query(
            "SELECT gpu_model, base_hourly FROM provider_rates WHERE provider_id = ?1",
        )
        .bind(provider_id.as_str())
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::database("get_provider_rates", e))?;

        let mut rates = HashMap::new();
        for row in rows {
            let model: String = row.get("gpu_model");
            let raw: String = row.get("base_hourly");
            let rate = Decimal::from_str(&raw)
                .map_err(|e| BrokerError::validation("base_hourly", e.to_string()))?;
            rates.insert(model, rate);
        }
        Ok(rates)
    }

    pub async fn upsert_provider_rate(
        &self,
        provider_id: &ProviderId,
        gpu_model: &str,
        base_hourly: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO provider_rates (provider_id, gpu_model, base_hourly, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(provider_id, gpu_model) DO UPDATE SET
                base_hourly = excluded.base_hourly,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(provider_id.as_str())
        .bind(gpu_model)
        .bind(base_hourly.to_string())
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| BrokerError::database("upsert_provider_rate", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_provider_rate_overrides_round_trip() {
        let store = Store::in_memory().await.unwrap();
        let provider = ProviderId::new("prov-1");

        assert!(store.get_provider_rates(&provider).await.unwrap().is_empty());

        store
            .upsert_provider_rate(&provider, "RTX 4090", dec!(0.45))
            .await
            .unwrap();
        store
            .upsert_provider_rate(&provider, "RTX 4090", dec!(0.40))
            .await
            .unwrap();

        let rates = store.get_provider_rates(&provider).await.unwrap();
        assert_eq!(rates.len(), 1);
        assert_eq!(rates["RTX 4090"], dec!(0.40));
    }
}
