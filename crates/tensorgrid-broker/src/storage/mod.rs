//! Durable, transactional persistence for all mutable entities.
//!
//! One repository module per aggregate; every operation is a single atomic
//! read or read-modify-write. Multi-wallet settlement paths compose the
//! `_tx` variants inside one SQLite transaction.

pub mod jobs;
pub mod ledger;
pub mod queue;
pub mod rates;
pub mod sessions;
pub mod usage;
pub mod wallets;

use crate::error::{BrokerError, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::time::Duration;

pub type StoreTx<'a> = Transaction<'a, Sqlite>;

/// Handle over the broker database.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) a file-backed store.
    pub async fn connect(
        database_path: &str,
        max_connections: u32,
        call_timeout: Duration,
    ) -> Result<Self> {
        let db_url = if database_path.starts_with("sqlite:") {
            database_path.to_string()
        } else {
            format!("sqlite:{database_path}")
        };

        let final_url = if db_url.contains('?') {
            db_url
        } else {
            format!("{db_url}?mode=rwc")
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(call_timeout)
            .connect(&final_url)
            .await
            .map_err(|e| BrokerError::database("connect", e))?;

        let store = Self { pool };
        store.configure_pragmas().await?;
        store.run_migrations().await?;
        Ok(store)
    }

    /// In-memory store for tests and local experiments.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // A single connection keeps every handle on the same in-memory db.
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| BrokerError::database("connect", e))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<StoreTx<'_>> {
        self.pool
            .begin()
            .await
            .map_err(|e| BrokerError::database("begin_transaction", e))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn configure_pragmas(&self) -> Result<()> {
        for pragma in [
            "PRAGMA journal_mode = WAL",
            "PRAGMA busy_timeout = 5000",
            "PRAGMA synchronous = NORMAL",
            "PRAGMA foreign_keys = ON",
        ] {
            sqlx::query(pragma)
                .execute(&self.pool)
                .await
                .map_err(|e| BrokerError::database("configure_pragmas", e))?;
        }
        Ok(())
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                state TEXT NOT NULL,
                requirements TEXT NOT NULL,
                execution TEXT NOT NULL,
                cost_ceiling TEXT NOT NULL,
                max_duration_minutes INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                input_files TEXT NOT NULL DEFAULT '[]',
                output_files TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}',
                last_error TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                assigned_provider TEXT,
                attempted_providers TEXT NOT NULL DEFAULT '[]',
                progress_percent INTEGER NOT NULL DEFAULT 0,
                stage TEXT,
                submitted_at TEXT NOT NULL,
                received_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_updated_at ON jobs(updated_at)",
            r#"
            CREATE TABLE IF NOT EXISTS wallets (
                wallet_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                wallet_type TEXT NOT NULL,
                settlement_address TEXT NOT NULL UNIQUE,
                available TEXT NOT NULL,
                locked TEXT NOT NULL,
                pending TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                version INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(owner_id, wallet_type)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS rental_sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                provider_id TEXT NOT NULL,
                job_id TEXT,
                status TEXT NOT NULL,
                gpu_model TEXT NOT NULL,
                allocated_vram_mb INTEGER NOT NULL,
                total_vram_mb INTEGER NOT NULL,
                vram_percentage TEXT NOT NULL,
                estimated_power_w INTEGER NOT NULL,
                actual_power_w TEXT,
                base_hourly TEXT NOT NULL,
                vram_per_gb_hour TEXT NOT NULL,
                power_per_kw_hour TEXT NOT NULL,
                platform_fee_percent TEXT NOT NULL,
                total_cost TEXT NOT NULL,
                platform_fee TEXT NOT NULL,
                provider_earnings TEXT NOT NULL,
                max_cost_ceiling TEXT NOT NULL,
                locked_funds TEXT NOT NULL,
                started_at TEXT NOT NULL,
                last_billed_at TEXT NOT NULL,
                ended_at TEXT,
                updated_at TEXT NOT NULL,
                end_reason TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sessions_user ON rental_sessions(user_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_provider ON rental_sessions(provider_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_status ON rental_sessions(status)",
            r#"
            CREATE TABLE IF NOT EXISTS usage_records (
                sample_id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                gpu_utilization_percent TEXT NOT NULL,
                vram_utilization_percent TEXT NOT NULL,
                power_draw_w TEXT NOT NULL,
                temperature_c TEXT NOT NULL,
                period_minutes TEXT NOT NULL,
                period_cost TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_usage_session ON usage_records(session_id, recorded_at)",
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                transaction_id TEXT PRIMARY KEY,
                transaction_type TEXT NOT NULL,
                status TEXT NOT NULL,
                from_wallet TEXT,
                to_wallet TEXT,
                amount TEXT NOT NULL,
                fee TEXT NOT NULL DEFAULT '0',
                description TEXT NOT NULL DEFAULT '',
                external_signature TEXT,
                session_id TEXT,
                job_id TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_tx_from_wallet ON transactions(from_wallet)",
            "CREATE INDEX IF NOT EXISTS idx_tx_to_wallet ON transactions(to_wallet)",
            "CREATE INDEX IF NOT EXISTS idx_tx_session ON transactions(session_id)",
            r#"
            CREATE TABLE IF NOT EXISTS billing_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                amount TEXT NOT NULL,
                accrued_total TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_billing_session ON billing_records(session_id, recorded_at)",
            r#"
            CREATE TABLE IF NOT EXISTS provider_rates (
                provider_id TEXT NOT NULL,
                gpu_model TEXT NOT NULL,
                base_hourly TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (provider_id, gpu_model)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS submission_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                subject TEXT NOT NULL,
                payload BLOB NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                enqueued_at TEXT NOT NULL,
                next_attempt_at TEXT NOT NULL,
                claimed_at TEXT,
                claimed_by TEXT,
                acked_at TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_queue_ready ON submission_queue(acked_at, next_attempt_at)",
        ];

        for statement in ddl {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| BrokerError::database("run_migrations", e))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_store_migrates() {
        let store = Store::in_memory().await.unwrap();
        // Migrations are idempotent
        store.run_migrations().await.unwrap();

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(store.pool())
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

        for expected in [
            "jobs",
            "wallets",
            "rental_sessions",
            "usage_records",
            "transactions",
            "billing_records",
            "provider_rates",
            "submission_queue",
        ] {
            assert!(names.contains(&expected), "missing table {expected}");
        }
    }
}
