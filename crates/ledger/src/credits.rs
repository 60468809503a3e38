//! Credit ledger: per-(tenant, entity) balances backed by an
//! append-only transaction log.
//!
//! `apply_delta` is the sole mutation path for balances. It runs the
//! read-balance, write-balance, append-transaction unit inside one
//! database transaction with a row lock, so concurrent webhook
//! deliveries for the same entity serialize instead of losing updates.

use rust_decimal::Decimal;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::directory::EntityDirectory;
use crate::error::{LedgerError, LedgerResult};

/// Categories of balance mutation recorded in the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Purchase,
    Consumption,
    SeasonalCampaign,
    Expiry,
    RefundAdjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::Consumption => "consumption",
            TransactionType::SeasonalCampaign => "seasonal_campaign",
            TransactionType::Expiry => "expiry",
            TransactionType::RefundAdjustment => "refund_adjustment",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "purchase" => Some(TransactionType::Purchase),
            "consumption" => Some(TransactionType::Consumption),
            "seasonal_campaign" => Some(TransactionType::SeasonalCampaign),
            "expiry" => Some(TransactionType::Expiry),
            "refund_adjustment" => Some(TransactionType::RefundAdjustment),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One balance row per (tenant, entity).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Credit {
    pub tenant_id: Uuid,
    pub entity_id: Uuid,
    pub available_credits: Decimal,
    pub reserved_credits: Decimal,
    pub is_active: bool,
    pub last_updated_at: OffsetDateTime,
}

/// Immutable ledger entry. Never edited after creation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub entity_id: Uuid,
    pub transaction_type: String,
    pub amount: Decimal,
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    pub operation_code: String,
    pub created_at: OffsetDateTime,
}

/// Result of an `apply_delta` call.
#[derive(Debug, Clone)]
pub struct DeltaOutcome {
    pub previous_balance: Decimal,
    pub new_balance: Decimal,
    /// False when an idempotency key suppressed the mutation.
    pub applied: bool,
}

/// Decision for a delta, evaluated against state read under the row
/// lock.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DeltaPlan {
    /// The operation code already has a ledger entry; report its
    /// recorded balances without mutating anything.
    Replay {
        previous_balance: Decimal,
        new_balance: Decimal,
    },
    /// Apply the (possibly clamped) amount.
    Apply {
        amount: Decimal,
        new_balance: Decimal,
    },
}

/// Decide what a delta does, given the balance and any prior
/// transaction with the same operation code, both read under the lock.
///
/// A replay wins over everything else. Expiry debits are floored at
/// the live balance, so a consumption that landed after the caller
/// computed its clawback cannot push the balance negative. Consumption
/// overdrafts are rejected outright.
fn plan_delta(
    replayed: Option<(Decimal, Decimal)>,
    previous_balance: Decimal,
    amount: Decimal,
    transaction_type: TransactionType,
) -> LedgerResult<DeltaPlan> {
    if let Some((previous, new)) = replayed {
        return Ok(DeltaPlan::Replay {
            previous_balance: previous,
            new_balance: new,
        });
    }

    let amount = if transaction_type == TransactionType::Expiry && amount < Decimal::ZERO {
        amount.max(-previous_balance.max(Decimal::ZERO))
    } else {
        amount
    };

    let new_balance = previous_balance + amount;
    if new_balance < Decimal::ZERO && transaction_type == TransactionType::Consumption {
        return Err(LedgerError::InsufficientCredits {
            available: previous_balance,
            requested: -amount,
        });
    }

    Ok(DeltaPlan::Apply {
        amount,
        new_balance,
    })
}

/// Filters for listing ledger transactions.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub tenant_id: Option<Uuid>,
    pub entity_id: Option<Uuid>,
    pub transaction_type: Option<TransactionType>,
    pub created_after: Option<OffsetDateTime>,
    pub created_before: Option<OffsetDateTime>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub limit: i64,
    pub offset: i64,
}

/// One page of ledger transactions.
#[derive(Debug, Clone)]
pub struct TransactionPage {
    pub transactions: Vec<CreditTransaction>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// One requested allocation inside a bulk operation.
#[derive(Debug, Clone)]
pub struct EntityAllocation {
    pub entity_id: Uuid,
    pub amount: Decimal,
}

/// Per-entity result of a bulk allocation. One bad entity must not
/// abort the batch.
#[derive(Debug)]
pub struct BulkAllocationOutcome {
    pub entity_id: Uuid,
    pub result: LedgerResult<DeltaOutcome>,
}

/// Service over the `credits` and `credit_transactions` tables.
#[derive(Clone)]
pub struct CreditService {
    pool: PgPool,
    directory: EntityDirectory,
}

impl CreditService {
    pub fn new(pool: PgPool, directory: EntityDirectory) -> Self {
        Self { pool, directory }
    }

    /// Fetch the balance row, creating a zero-balance row on first
    /// touch. Never errors on a missing row.
    pub async fn get_balance(&self, tenant_id: Uuid, entity_id: Uuid) -> LedgerResult<Credit> {
        sqlx::query(
            r#"
            INSERT INTO credits (tenant_id, entity_id, available_credits, reserved_credits, is_active, last_updated_at)
            VALUES ($1, $2, 0, 0, true, NOW())
            ON CONFLICT (tenant_id, entity_id) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(entity_id)
        .execute(&self.pool)
        .await?;

        let credit: Credit = sqlx::query_as(
            r#"
            SELECT tenant_id, entity_id, available_credits, reserved_credits, is_active, last_updated_at
            FROM credits
            WHERE tenant_id = $1 AND entity_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(entity_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(credit)
    }

    /// Sum available credits across an entity and all of its
    /// descendants in the tenant hierarchy.
    ///
    /// Returns the rollup and the number of descendants included.
    pub async fn subtree_balance(
        &self,
        tenant_id: Uuid,
        entity_id: Uuid,
    ) -> LedgerResult<(Decimal, usize)> {
        let entity = self.directory.resolve(tenant_id, entity_id).await?;
        if entity.is_none() {
            return Err(LedgerError::EntityNotFound {
                tenant_id,
                entity_id,
            });
        }

        let descendants = self.directory.descendants(tenant_id, entity_id).await?;
        let mut ids: Vec<Uuid> = descendants.iter().copied().collect();
        ids.push(entity_id);

        let (total,): (Decimal,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(available_credits), 0)
            FROM credits
            WHERE tenant_id = $1 AND entity_id = ANY($2)
            "#,
        )
        .bind(tenant_id)
        .bind(&ids)
        .fetch_one(&self.pool)
        .await?;

        Ok((total, descendants.len()))
    }

    /// Apply a signed delta to an entity's balance and append exactly
    /// one transaction, as a single atomic unit.
    ///
    /// When `idempotency_key` is supplied, the whole operation is a
    /// no-op if a transaction carrying that operation code already
    /// exists for the tenant. The duplicate check runs after the row
    /// lock is held, inside the same transaction, so two concurrent
    /// deliveries of the same key serialize on the lock and the loser
    /// sees the winner's committed entry. This is what makes webhook
    /// retries safe.
    ///
    /// Negative balances are rejected only for `consumption` debits;
    /// `expiry` debits are floored at the live balance.
    pub async fn apply_delta(
        &self,
        tenant_id: Uuid,
        entity_id: Uuid,
        amount: Decimal,
        transaction_type: TransactionType,
        operation_code: &str,
        idempotency_key: Option<&str>,
    ) -> LedgerResult<DeltaOutcome> {
        let entity = self.directory.resolve(tenant_id, entity_id).await?;
        if entity.is_none() {
            return Err(LedgerError::EntityNotFound {
                tenant_id,
                entity_id,
            });
        }

        let mut tx = self.pool.begin().await?;

        // Ensure the row exists, then lock it for the duration of the
        // read-compute-write unit.
        sqlx::query(
            r#"
            INSERT INTO credits (tenant_id, entity_id, available_credits, reserved_credits, is_active, last_updated_at)
            VALUES ($1, $2, 0, 0, true, NOW())
            ON CONFLICT (tenant_id, entity_id) DO NOTHING
            "#,
        )
        .bind(tenant_id)
        .bind(entity_id)
        .execute(&mut *tx)
        .await?;

        let (previous_balance,): (Decimal,) = sqlx::query_as(
            r#"
            SELECT available_credits FROM credits
            WHERE tenant_id = $1 AND entity_id = $2
            FOR UPDATE
            "#,
        )
        .bind(tenant_id)
        .bind(entity_id)
        .fetch_one(&mut *tx)
        .await?;

        // Only now that the lock is held: a concurrent duplicate has
        // either committed (visible here) or is blocked behind us.
        let replayed: Option<(Decimal, Decimal)> = match idempotency_key {
            Some(key) => {
                sqlx::query_as(
                    r#"
                    SELECT previous_balance, new_balance
                    FROM credit_transactions
                    WHERE tenant_id = $1 AND operation_code = $2
                    ORDER BY created_at DESC
                    LIMIT 1
                    "#,
                )
                .bind(tenant_id)
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?
            }
            None => None,
        };

        let plan = match plan_delta(replayed, previous_balance, amount, transaction_type) {
            Ok(plan) => plan,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        let (amount, new_balance) = match plan {
            DeltaPlan::Replay {
                previous_balance,
                new_balance,
            } => {
                tx.rollback().await?;
                tracing::info!(
                    tenant_id = %tenant_id,
                    entity_id = %entity_id,
                    operation_code = %operation_code,
                    "Idempotency hit - delta already applied, skipping"
                );
                return Ok(DeltaOutcome {
                    previous_balance,
                    new_balance,
                    applied: false,
                });
            }
            DeltaPlan::Apply {
                amount,
                new_balance,
            } => (amount, new_balance),
        };

        sqlx::query(
            r#"
            UPDATE credits
            SET available_credits = $3, last_updated_at = NOW()
            WHERE tenant_id = $1 AND entity_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(entity_id)
        .bind(new_balance)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO credit_transactions
                (id, tenant_id, entity_id, transaction_type, amount,
                 previous_balance, new_balance, operation_code, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(entity_id)
        .bind(transaction_type.as_str())
        .bind(amount)
        .bind(previous_balance)
        .bind(new_balance)
        .bind(operation_code)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            tenant_id = %tenant_id,
            entity_id = %entity_id,
            transaction_type = %transaction_type,
            amount = %amount,
            previous_balance = %previous_balance,
            new_balance = %new_balance,
            operation_code = %operation_code,
            "Credit delta applied"
        );

        Ok(DeltaOutcome {
            previous_balance,
            new_balance,
            applied: true,
        })
    }

    /// Allocate credits to several entities in one administrative call.
    ///
    /// Entities are processed independently: a failure is recorded in
    /// the outcome list and the rest of the batch continues.
    pub async fn bulk_allocate(
        &self,
        tenant_id: Uuid,
        allocations: &[EntityAllocation],
        transaction_type: TransactionType,
        operation_code: &str,
    ) -> Vec<BulkAllocationOutcome> {
        let mut outcomes = Vec::with_capacity(allocations.len());

        for allocation in allocations {
            let code = format!("{}:{}", operation_code, allocation.entity_id);
            let result = self
                .apply_delta(
                    tenant_id,
                    allocation.entity_id,
                    allocation.amount,
                    transaction_type,
                    &code,
                    Some(&code),
                )
                .await;

            if let Err(e) = &result {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    entity_id = %allocation.entity_id,
                    error = %e,
                    "Bulk allocation failed for entity"
                );
            }

            outcomes.push(BulkAllocationOutcome {
                entity_id: allocation.entity_id,
                result,
            });
        }

        outcomes
    }

    /// List ledger transactions matching the filter, newest first.
    pub async fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> LedgerResult<TransactionPage> {
        let limit = filter.limit.clamp(1, 200);
        let offset = filter.offset.max(0);
        let type_str = filter.transaction_type.map(|t| t.as_str());

        let transactions: Vec<CreditTransaction> = sqlx::query_as(
            r#"
            SELECT id, tenant_id, entity_id, transaction_type, amount,
                   previous_balance, new_balance, operation_code, created_at
            FROM credit_transactions
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND ($2::uuid IS NULL OR entity_id = $2)
              AND ($3::text IS NULL OR transaction_type = $3)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at <= $5)
              AND ($6::numeric IS NULL OR amount >= $6)
              AND ($7::numeric IS NULL OR amount <= $7)
            ORDER BY created_at DESC
            LIMIT $8 OFFSET $9
            "#,
        )
        .bind(filter.tenant_id)
        .bind(filter.entity_id)
        .bind(type_str)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(filter.min_amount)
        .bind(filter.max_amount)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM credit_transactions
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND ($2::uuid IS NULL OR entity_id = $2)
              AND ($3::text IS NULL OR transaction_type = $3)
              AND ($4::timestamptz IS NULL OR created_at >= $4)
              AND ($5::timestamptz IS NULL OR created_at <= $5)
              AND ($6::numeric IS NULL OR amount >= $6)
              AND ($7::numeric IS NULL OR amount <= $7)
            "#,
        )
        .bind(filter.tenant_id)
        .bind(filter.entity_id)
        .bind(type_str)
        .bind(filter.created_after)
        .bind(filter.created_before)
        .bind(filter.min_amount)
        .bind(filter.max_amount)
        .fetch_one(&self.pool)
        .await?;

        Ok(TransactionPage {
            transactions,
            total,
            limit,
            offset,
        })
    }
}

/// A break in the previous/new balance chain for one (tenant, entity).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainViolation {
    pub transaction_id: Uuid,
    pub description: String,
}

/// Verify the balance chain over transactions for a single
/// (tenant, entity), ordered by creation time ascending.
///
/// Two properties must hold for every entry: its own arithmetic
/// (`new_balance = previous_balance + amount`) and continuity with its
/// predecessor (`previous_balance` equals the prior `new_balance`).
pub fn chain_violations(transactions: &[CreditTransaction]) -> Vec<ChainViolation> {
    let mut violations = Vec::new();
    let mut expected_previous: Option<Decimal> = None;

    for tx in transactions {
        if tx.previous_balance + tx.amount != tx.new_balance {
            violations.push(ChainViolation {
                transaction_id: tx.id,
                description: format!(
                    "arithmetic break: {} + {} != {}",
                    tx.previous_balance, tx.amount, tx.new_balance
                ),
            });
        }

        if let Some(expected) = expected_previous {
            if tx.previous_balance != expected {
                violations.push(ChainViolation {
                    transaction_id: tx.id,
                    description: format!(
                        "continuity break: previous_balance {} but prior new_balance {}",
                        tx.previous_balance, expected
                    ),
                });
            }
        }

        expected_previous = Some(tx.new_balance);
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tx(amount: Decimal, previous: Decimal, new: Decimal) -> CreditTransaction {
        CreditTransaction {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            entity_id: Uuid::new_v4(),
            transaction_type: "purchase".to_string(),
            amount,
            previous_balance: previous,
            new_balance: new,
            operation_code: "test".to_string(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn transaction_type_round_trips() {
        for t in [
            TransactionType::Purchase,
            TransactionType::Consumption,
            TransactionType::SeasonalCampaign,
            TransactionType::Expiry,
            TransactionType::RefundAdjustment,
        ] {
            assert_eq!(TransactionType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(TransactionType::from_str("bonus"), None);
    }

    #[test]
    fn replayed_operation_code_wins_over_everything() {
        // A concurrent delivery already committed +500 for this code;
        // the second delivery must report the recorded balances and
        // never reach an apply.
        let plan = plan_delta(
            Some((dec!(0), dec!(500))),
            dec!(500),
            dec!(500),
            TransactionType::Purchase,
        )
        .unwrap();
        assert_eq!(
            plan,
            DeltaPlan::Replay {
                previous_balance: dec!(0),
                new_balance: dec!(500),
            }
        );
    }

    #[test]
    fn fresh_operation_code_applies() {
        let plan = plan_delta(None, dec!(100), dec!(250), TransactionType::Purchase).unwrap();
        assert_eq!(
            plan,
            DeltaPlan::Apply {
                amount: dec!(250),
                new_balance: dec!(350),
            }
        );
    }

    #[test]
    fn consumption_overdraft_is_rejected() {
        let err = plan_delta(None, dec!(100), dec!(-150), TransactionType::Consumption)
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientCredits {
                available,
                requested,
            } if available == dec!(100) && requested == dec!(150)
        ));
    }

    #[test]
    fn expiry_debit_floors_at_live_balance() {
        // Clawback of 380 against a balance a concurrent consumption
        // drove down to 300: only 300 comes back, balance lands on 0.
        let plan = plan_delta(None, dec!(300), dec!(-380), TransactionType::Expiry).unwrap();
        assert_eq!(
            plan,
            DeltaPlan::Apply {
                amount: dec!(-300),
                new_balance: dec!(0),
            }
        );

        // With cover for the full debit, nothing is clamped.
        let plan = plan_delta(None, dec!(500), dec!(-380), TransactionType::Expiry).unwrap();
        assert_eq!(
            plan,
            DeltaPlan::Apply {
                amount: dec!(-380),
                new_balance: dec!(120),
            }
        );
    }

    #[test]
    fn expiry_debit_on_nonpositive_balance_is_a_noop() {
        let plan = plan_delta(None, dec!(-5), dec!(-10), TransactionType::Expiry).unwrap();
        assert_eq!(
            plan,
            DeltaPlan::Apply {
                amount: dec!(0),
                new_balance: dec!(-5),
            }
        );
    }

    #[test]
    fn valid_chain_has_no_violations() {
        let txs = vec![
            tx(dec!(100), dec!(0), dec!(100)),
            tx(dec!(-30), dec!(100), dec!(70)),
            tx(dec!(250), dec!(70), dec!(320)),
        ];
        assert!(chain_violations(&txs).is_empty());
    }

    #[test]
    fn final_balance_is_sum_of_amounts() {
        let txs = vec![
            tx(dec!(100), dec!(0), dec!(100)),
            tx(dec!(-30), dec!(100), dec!(70)),
            tx(dec!(250), dec!(70), dec!(320)),
        ];
        let sum: Decimal = txs.iter().map(|t| t.amount).sum();
        assert_eq!(txs.last().map(|t| t.new_balance), Some(sum));
        // Replaying the log reconstructs every intermediate balance.
        assert!(chain_violations(&txs).is_empty());
    }

    #[test]
    fn arithmetic_break_is_flagged() {
        let txs = vec![tx(dec!(100), dec!(0), dec!(90))];
        let violations = chain_violations(&txs);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].description.contains("arithmetic break"));
    }

    #[test]
    fn continuity_break_is_flagged() {
        let txs = vec![
            tx(dec!(100), dec!(0), dec!(100)),
            // Claims to start from 50, but the prior entry ended at 100.
            tx(dec!(10), dec!(50), dec!(60)),
        ];
        let violations = chain_violations(&txs);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].description.contains("continuity break"));
    }

    #[test]
    fn empty_log_is_valid() {
        assert!(chain_violations(&[]).is_empty());
    }
}
