//! Notification queue.
//!
//! The ledger never sends notifications inline; it enqueues rows that
//! the worker drains on a schedule, with attempt counting. Delivery
//! itself is an external collaborator.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::LedgerResult;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedNotification {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub created_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct NotificationQueue {
    pool: PgPool,
}

impl NotificationQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn enqueue(
        &self,
        tenant_id: Uuid,
        kind: &str,
        payload: serde_json::Value,
    ) -> LedgerResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO notification_queue (id, tenant_id, kind, payload, status, attempts, created_at)
            VALUES ($1, $2, $3, $4, 'queued', 0, NOW())
            "#,
        )
        .bind(id)
        .bind(tenant_id)
        .bind(kind)
        .bind(&payload)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Claim a batch of queued notifications for delivery.
    pub async fn claim_batch(&self, limit: i64) -> LedgerResult<Vec<QueuedNotification>> {
        let batch: Vec<QueuedNotification> = sqlx::query_as(
            r#"
            UPDATE notification_queue
            SET attempts = attempts + 1
            WHERE id IN (
                SELECT id FROM notification_queue
                WHERE status = 'queued' AND attempts < 5
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, tenant_id, kind, payload, status, attempts, created_at
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(batch)
    }

    pub async fn mark_sent(&self, id: Uuid) -> LedgerResult<()> {
        sqlx::query("UPDATE notification_queue SET status = 'sent', sent_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_failed(&self, id: Uuid, attempts: i32) -> LedgerResult<()> {
        // After five attempts the row parks as failed for operator review.
        let status = if attempts >= 5 { "failed" } else { "queued" };
        sqlx::query("UPDATE notification_queue SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
