use crate::domain::{
    JobId, LedgerTransaction, SessionId, TokenAmount, TransactionStatus, TransactionType, WalletId,
};
use crate::error::{BrokerError, Result};
use crate::storage::{Store, StoreTx};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

impl Store {
    pub async fn create_transaction(&self, tx_record: &LedgerTransaction) -> Result<()> {
        let mut tx = self.begin().await?;
        self.create_transaction_tx(&mut tx, tx_record).await?;
        tx.commit()
            .await
            .map_err(|e| BrokerError::database("create_transaction", e))?;
        Ok(())
    }

    pub async fn create_transaction_tx(
        &self,
        tx: &mut StoreTx<'_>,
        record: &LedgerTransaction,
    ) -> Result<()> {
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| BrokerError::validation("metadata", e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO transactions
            (transaction_id, transaction_type, status, from_wallet, to_wallet,
             amount, fee, description, external_signature, session_id, job_id,
             metadata, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.transaction_type.to_string())
        .bind(record.status.to_string())
        .bind(record.from_wallet.map(|w| w.to_string()))
        .bind(record.to_wallet.map(|w| w.to_string()))
        .bind(record.amount.persisted().to_string())
        .bind(record.fee.persisted().to_string())
        .bind(&record.description)
        .bind(&record.external_signature)
        .bind(record.session_id.map(|s| s.to_string()))
        .bind(record.job_id.as_ref().map(|j| j.to_string()))
        .bind(metadata)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| BrokerError::database("create_transaction", e))?;

        Ok(())
    }

    pub async fn update_transaction_status(
        &self,
        id: Uuid,
        status: TransactionStatus,
        signature: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = ?2, external_signature = COALESCE(?3, external_signature), updated_at = ?4
            WHERE transaction_id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(status.to_string())
        .bind(signature)
        .bind(Utc::now())
        .execute(self.pool())
        .await
        .map_err(|e| BrokerError::database("update_transaction_status", e))?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::NotFound {
                entity: "transaction",
                id: id.to_string(),
            });
        }

        Ok(())
    }

    pub async fn get_transaction(&self, id: Uuid) -> Result<Option<LedgerTransaction>> {
        let row = sqlx::query("SELECT * FROM transactions WHERE transaction_id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(|e| BrokerError::database("get_transaction", e))?;

        row.map(|r| transaction_from_row(&r)).transpose()
    }

    pub async fn get_transactions_by_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<LedgerTransaction>> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE session_id = ?1 ORDER BY created_at ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::database("get_transactions_by_session", e))?;

        rows.iter().map(transaction_from_row).collect()
    }

    pub async fn get_transactions_by_wallet(
        &self,
        wallet_id: &WalletId,
        limit: i64,
    ) -> Result<Vec<LedgerTransaction>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM transactions
            WHERE from_wallet = ?1 OR to_wallet = ?1
            ORDER BY created_at DESC
            LIMIT ?2
            "#,
        )
        .bind(wallet_id.to_string())
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::database("get_transactions_by_wallet", e))?;

        rows.iter().map(transaction_from_row).collect()
    }
}

fn transaction_from_row(r: &SqliteRow) -> Result<LedgerTransaction> {
    let id: String = r.get("transaction_id");
    let id = Uuid::from_str(&id).map_err(|e| BrokerError::validation("transaction_id", e.to_string()))?;

    let tx_type: String = r.get("transaction_type");
    let tx_type = TransactionType::from_str(&tx_type)
        .map_err(|e| BrokerError::validation("transaction_type", e))?;

    let status: String = r.get("status");
    let status =
        TransactionStatus::from_str(&status).map_err(|e| BrokerError::validation("status", e))?;

    let wallet = |column: &str| -> Result<Option<WalletId>> {
        r.get::<Option<String>, _>(column)
            .map(|raw| {
                WalletId::from_str(&raw)
                    .map_err(|e| BrokerError::validation(column.to_string(), e.to_string()))
            })
            .transpose()
    };

    let amount = |column: &str| -> Result<TokenAmount> {
        let raw: String = r.get(column);
        Decimal::from_str(&raw)
            .map(TokenAmount::from_decimal)
            .map_err(|e| BrokerError::validation(column.to_string(), e.to_string()))
    };

    let metadata: String = r.get("metadata");

    Ok(LedgerTransaction {
        id,
        transaction_type: tx_type,
        status,
        from_wallet: wallet("from_wallet")?,
        to_wallet: wallet("to_wallet")?,
        amount: amount("amount")?,
        fee: amount("fee")?,
        description: r.get("description"),
        external_signature: r.get("external_signature"),
        session_id: r
            .get::<Option<String>, _>("session_id")
            .map(|raw| {
                SessionId::from_str(&raw)
                    .map_err(|e| BrokerError::validation("session_id", e.to_string()))
            })
            .transpose()?,
        job_id: r.get::<Option<String>, _>("job_id").map(JobId::new),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}
