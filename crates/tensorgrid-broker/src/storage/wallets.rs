use crate::domain::{TokenAmount, Wallet, WalletId, WalletType};
use crate::error::{BrokerError, Result};
use crate::storage::{Store, StoreTx};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;

impl Store {
    /// Create a wallet. Uniqueness on (owner, type) and on the settlement
    /// address is enforced by the schema.
    pub async fn create_wallet(&self, wallet: &Wallet) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO wallets
            (wallet_id, owner_id, wallet_type, settlement_address,
             available, locked, pending, active, version, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(wallet.id.to_string())
        .bind(&wallet.owner_id)
        .bind(wallet.wallet_type.to_string())
        .bind(&wallet.settlement_address)
        .bind(wallet.available.persisted().to_string())
        .bind(wallet.locked.persisted().to_string())
        .bind(wallet.pending.persisted().to_string())
        .bind(wallet.active)
        .bind(wallet.version)
        .bind(wallet.created_at)
        .bind(wallet.updated_at)
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(BrokerError::Conflict {
                    entity: "wallet",
                    id: format!("{}/{}", wallet.owner_id, wallet.wallet_type),
                })
            }
            Err(e) => Err(BrokerError::database("create_wallet", e)),
        }
    }

    pub async fn get_wallet(&self, id: &WalletId) -> Result<Option<Wallet>> {
        let row = sqlx::query("SELECT * FROM wallets WHERE wallet_id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| BrokerError::database("get_wallet", e))?;

        row.map(|r| wallet_from_row(&r)).transpose()
    }

    pub async fn get_wallet_by_owner(
        &self,
        owner_id: &str,
        wallet_type: WalletType,
    ) -> Result<Option<Wallet>> {
        let row = sqlx::query("SELECT * FROM wallets WHERE owner_id = ?1 AND wallet_type = ?2")
            .bind(owner_id)
            .bind(wallet_type.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| BrokerError::database("get_wallet_by_owner", e))?;

        row.map(|r| wallet_from_row(&r)).transpose()
    }

    /// The sole path by which balances change.
    ///
    /// Enforces non-negativity and the optimistic version check: fails with
    /// a conflict if the row version moved since the caller's read.
    pub async fn update_wallet_balances(&self, wallet: &Wallet) -> Result<Wallet> {
        let mut tx = self.begin().await?;
        let updated = self.update_wallet_balances_tx(&mut tx, wallet).await?;
        tx.commit()
            .await
            .map_err(|e| BrokerError::database("update_wallet_balances", e))?;
        Ok(updated)
    }

    pub async fn update_wallet_balances_tx(
        &self,
        tx: &mut StoreTx<'_>,
        wallet: &Wallet,
    ) -> Result<Wallet> {
        if !wallet.balances_valid() {
            return Err(BrokerError::validation(
                "balances",
                format!(
                    "negative balance rejected (available {}, locked {}, pending {})",
                    wallet.available, wallet.locked, wallet.pending
                ),
            ));
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE wallets
            SET available = ?3, locked = ?4, pending = ?5, version = version + 1, updated_at = ?6
            WHERE wallet_id = ?1 AND version = ?2
            "#,
        )
        .bind(wallet.id.to_string())
        .bind(wallet.version)
        .bind(wallet.available.persisted().to_string())
        .bind(wallet.locked.persisted().to_string())
        .bind(wallet.pending.persisted().to_string())
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| BrokerError::database("update_wallet_balances", e))?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM wallets WHERE wallet_id = ?1")
                .bind(wallet.id.to_string())
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| BrokerError::database("update_wallet_balances", e))?
                .is_some();

            return Err(if exists {
                BrokerError::Conflict {
                    entity: "wallet",
                    id: wallet.id.to_string(),
                }
            } else {
                BrokerError::NotFound {
                    entity: "wallet",
                    id: wallet.id.to_string(),
                }
            });
        }

        let mut updated = wallet.clone();
        updated.version += 1;
        updated.updated_at = now;
        Ok(updated)
    }
}

fn wallet_from_row(r: &SqliteRow) -> Result<Wallet> {
    let wallet_type: String = r.get("wallet_type");
    let wallet_type = WalletType::from_str(&wallet_type)
        .map_err(|e| BrokerError::validation("wallet_type", e))?;

    let wallet_id: String = r.get("wallet_id");
    let wallet_id = WalletId::from_str(&wallet_id)
        .map_err(|e| BrokerError::validation("wallet_id", e.to_string()))?;

    let amount = |column: &str| -> Result<TokenAmount> {
        let raw: String = r.get(column);
        Decimal::from_str(&raw)
            .map(TokenAmount::from_decimal)
            .map_err(|e| BrokerError::validation(column.to_string(), e.to_string()))
    };

    Ok(Wallet {
        id: wallet_id,
        owner_id: r.get("owner_id"),
        wallet_type,
        settlement_address: r.get("settlement_address"),
        available: amount("available")?,
        locked: amount("locked")?,
        pending: amount("pending")?,
        active: r.get("active"),
        version: r.get("version"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    async fn funded_wallet(store: &Store, owner: &str, amount: Decimal) -> Wallet {
        let mut wallet = Wallet::new(owner, WalletType::User, format!("addr-{owner}"));
        wallet.credit(TokenAmount::from_decimal(amount));
        store.create_wallet(&wallet).await.unwrap();
        wallet
    }

    #[tokio::test]
    async fn test_wallet_round_trip_and_owner_lookup() {
        let store = Store::in_memory().await.unwrap();
        let wallet = funded_wallet(&store, "user-1", dec!(10)).await;

        let loaded = store.get_wallet(&wallet.id).await.unwrap().unwrap();
        assert_eq!(loaded.available.as_decimal(), dec!(10));
        assert_eq!(loaded.version, 0);

        let by_owner = store
            .get_wallet_by_owner("user-1", WalletType::User)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_owner.id, wallet.id);

        assert!(store
            .get_wallet_by_owner("user-1", WalletType::Provider)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_owner_type_is_a_conflict() {
        let store = Store::in_memory().await.unwrap();
        funded_wallet(&store, "user-1", dec!(10)).await;

        let dup = Wallet::new("user-1", WalletType::User, "addr-other");
        let err = store.create_wallet(&dup).await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_stale_version_write_conflicts() {
        let store = Store::in_memory().await.unwrap();
        let wallet = funded_wallet(&store, "user-1", dec!(10)).await;

        // First writer wins and bumps the version
        let mut first = wallet.clone();
        first.lock(TokenAmount::from_decimal(dec!(2))).unwrap();
        let first = store.update_wallet_balances(&first).await.unwrap();
        assert_eq!(first.version, 1);

        // Second writer still holds version 0
        let mut second = wallet.clone();
        second.lock(TokenAmount::from_decimal(dec!(5))).unwrap();
        let err = store.update_wallet_balances(&second).await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict { .. }));

        // Re-read and retry succeeds
        let mut reread = store.get_wallet(&wallet.id).await.unwrap().unwrap();
        reread.lock(TokenAmount::from_decimal(dec!(5))).unwrap();
        let after = store.update_wallet_balances(&reread).await.unwrap();
        assert_eq!(after.version, 2);
        assert_eq!(after.available.as_decimal(), dec!(3));
        assert_eq!(after.locked.as_decimal(), dec!(7));
    }

    #[tokio::test]
    async fn test_negative_balances_are_rejected() {
        let store = Store::in_memory().await.unwrap();
        let mut wallet = funded_wallet(&store, "user-1", dec!(1)).await;

        wallet.available = TokenAmount::from_decimal(dec!(-0.5));
        let err = store.update_wallet_balances(&wallet).await.unwrap_err();
        assert!(matches!(err, BrokerError::Validation { .. }));
    }
}
