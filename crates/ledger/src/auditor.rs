//! Consistency auditor: cross-checks the ledger against the entity
//! directory and the transaction chain.
//!
//! Balance rows keyed by a deleted or deactivated entity are orphans.
//! Detection is read-only; cleanup deactivates the rows and reports
//! what it removed.

use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::{chain_violations, ChainViolation, CreditTransaction};
use crate::error::LedgerResult;
use crate::events::{ActorType, LedgerEventBuilder, LedgerEventLogger};

/// One balance row with no live entity behind it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OrphanedCredit {
    pub tenant_id: Uuid,
    pub entity_id: Uuid,
    pub available_credits: Decimal,
    pub last_updated_at: OffsetDateTime,
    /// "missing" when the entity row is gone, "inactive" when it is
    /// soft-deleted.
    pub reason: String,
}

/// What a cleanup pass did.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CleanupReport {
    pub orphans_found: usize,
    pub orphans_removed: usize,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_credits_cleaned: Decimal,
}

/// Chain verification result for one (tenant, entity).
#[derive(Debug)]
pub struct ChainReport {
    pub tenant_id: Uuid,
    pub entity_id: Uuid,
    pub transactions_checked: usize,
    pub violations: Vec<ChainViolation>,
}

#[derive(Clone)]
pub struct ConsistencyAuditor {
    pool: PgPool,
    event_logger: LedgerEventLogger,
}

impl ConsistencyAuditor {
    pub fn new(pool: PgPool) -> Self {
        Self {
            event_logger: LedgerEventLogger::new(pool.clone()),
            pool,
        }
    }

    /// Find balance rows whose entity is missing or inactive for a
    /// tenant. Read-only.
    pub async fn detect_orphans(&self, tenant_id: Uuid) -> LedgerResult<Vec<OrphanedCredit>> {
        let orphans: Vec<OrphanedCredit> = sqlx::query_as(
            r#"
            SELECT c.tenant_id, c.entity_id, c.available_credits, c.last_updated_at,
                   CASE WHEN e.id IS NULL THEN 'missing' ELSE 'inactive' END AS reason
            FROM credits c
            LEFT JOIN entities e ON e.id = c.entity_id AND e.tenant_id = c.tenant_id
            WHERE c.tenant_id = $1
              AND (e.id IS NULL OR e.is_active = false)
            ORDER BY c.last_updated_at ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        if !orphans.is_empty() {
            tracing::warn!(
                tenant_id = %tenant_id,
                count = orphans.len(),
                "Orphaned credit balances detected"
            );
        }

        Ok(orphans)
    }

    /// Delete orphaned balance rows for a tenant. Destructive and
    /// operator-triggered only; the transaction log is left untouched
    /// so history stays replayable.
    pub async fn clean_orphans(&self, tenant_id: Uuid) -> LedgerResult<CleanupReport> {
        let orphans = self.detect_orphans(tenant_id).await?;

        let mut removed = 0usize;
        let mut total_cleaned = Decimal::ZERO;

        for orphan in &orphans {
            let result = sqlx::query(
                r#"
                DELETE FROM credits
                WHERE tenant_id = $1 AND entity_id = $2
                "#,
            )
            .bind(orphan.tenant_id)
            .bind(orphan.entity_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                removed += 1;
                total_cleaned += orphan.available_credits;

                self.event_logger
                    .log_best_effort(
                        LedgerEventBuilder::new(Some(orphan.tenant_id), "orphan_credit_cleaned")
                            .actor_type(ActorType::System)
                            .data(serde_json::json!({
                                "entity_id": orphan.entity_id,
                                "available_credits": orphan.available_credits.to_string(),
                                "reason": orphan.reason,
                            })),
                    )
                    .await;
            }
        }

        let report = CleanupReport {
            orphans_found: orphans.len(),
            orphans_removed: removed,
            total_credits_cleaned: total_cleaned,
        };

        tracing::info!(
            tenant_id = %tenant_id,
            orphans_found = report.orphans_found,
            orphans_removed = report.orphans_removed,
            total_credits_cleaned = %report.total_credits_cleaned,
            "Orphan cleanup complete"
        );

        Ok(report)
    }

    /// Verify the transaction chain for one (tenant, entity).
    pub async fn verify_transaction_chain(
        &self,
        tenant_id: Uuid,
        entity_id: Uuid,
    ) -> LedgerResult<ChainReport> {
        let transactions: Vec<CreditTransaction> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, entity_id, transaction_type, amount,
                   previous_balance, new_balance, operation_code, created_at
            FROM credit_transactions
            WHERE tenant_id = $1 AND entity_id = $2
            ORDER BY created_at ASC
            "#,
        )
        .bind(tenant_id)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;

        let violations = chain_violations(&transactions);

        if !violations.is_empty() {
            tracing::error!(
                tenant_id = %tenant_id,
                entity_id = %entity_id,
                violations = violations.len(),
                "Transaction chain violations found"
            );
        }

        Ok(ChainReport {
            tenant_id,
            entity_id,
            transactions_checked: transactions.len(),
            violations,
        })
    }
}
