use crate::error::{BrokerError, Result};
use crate::storage::Store;
use chrono::{Duration, Utc};
use sqlx::Row;

/// A claimed queue message awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: i64,
    pub subject: String,
    pub payload: Vec<u8>,
    pub attempts: u32,
}

impl Store {
    /// Durably enqueue a message. Survives restarts; delivery is
    /// at-least-once.
    pub async fn enqueue_message(&self, subject: &str, payload: &[u8]) -> Result<i64> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            INSERT INTO submission_queue (subject, payload, enqueued_at, next_attempt_at)
            VALUES (?1, ?2, ?3, ?3)
            RETURNING id
            "#,
        )
        .bind(subject)
        .bind(payload)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(|e| BrokerError::database("enqueue_message", e))?;

        Ok(row.get("id"))
    }

    /// Claim up to `limit` deliverable messages for a consumer.
    ///
    /// A message is deliverable when it is unacked, its redelivery delay has
    /// elapsed, and any previous claim is older than `ack_wait` (a consumer
    /// that crashed before acking loses its claim after the ack-wait
    /// window).
    pub async fn claim_messages(
        &self,
        subject: &str,
        consumer: &str,
        limit: i64,
        ack_wait: Duration,
    ) -> Result<Vec<QueuedMessage>> {
        let now = Utc::now();
        let claim_cutoff = now - ack_wait;

        let rows = sqlx::query(
            r#"
            UPDATE submission_queue
            SET claimed_at = ?1, claimed_by = ?2, attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM submission_queue
                WHERE subject = ?3
                  AND acked_at IS NULL
                  AND next_attempt_at <= ?1
                  AND (claimed_at IS NULL OR claimed_at < ?4)
                ORDER BY id
                LIMIT ?5
            )
            RETURNING id, subject, payload, attempts
            "#,
        )
        .bind(now)
        .bind(consumer)
        .bind(subject)
        .bind(claim_cutoff)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(|e| BrokerError::database("claim_messages", e))?;

        Ok(rows
            .into_iter()
            .map(|r| QueuedMessage {
                id: r.get("id"),
                subject: r.get("subject"),
                payload: r.get("payload"),
                attempts: r.get::<i64, _>("attempts") as u32,
            })
            .collect())
    }

    /// Acknowledge a message, removing it from delivery.
    pub async fn ack_message(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE submission_queue SET acked_at = ?2 WHERE id = ?1 AND acked_at IS NULL")
            .bind(id)
            .bind(Utc::now())
            .execute(self.pool())
            .await
            .map_err(|e| BrokerError::database("ack_message", e))?;
        Ok(())
    }

    /// Negative-acknowledge: release the claim and schedule redelivery
    /// after `delay`.
    pub async fn nak_message(&self, id: i64, delay: Duration) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE submission_queue
            SET claimed_at = NULL, claimed_by = NULL, next_attempt_at = ?2
            WHERE id = ?1 AND acked_at IS NULL
            "#,
        )
        .bind(id)
        .bind(Utc::now() + delay)
        .execute(self.pool())
        .await
        .map_err(|e| BrokerError::database("nak_message", e))?;
        Ok(())
    }

    pub async fn pending_message_count(&self, subject: &str) -> Result<usize> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM submission_queue WHERE subject = ?1 AND acked_at IS NULL",
        )
        .bind(subject)
        .fetch_one(self.pool())
        .await
        .map_err(|e| BrokerError::database("pending_message_count", e))?;

        let count: i64 = row.get("count");
        Ok(count as usize)
    }
}
