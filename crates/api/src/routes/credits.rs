//! Balance and ledger endpoints.
//!
//! All monetary amounts cross this boundary as decimal strings.

use axum::extract::{Path, Query, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use tally_ledger::{
    EntityAllocation, LedgerError, TransactionFilter, TransactionType,
};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    /// Also roll the balance up over the entity's hierarchy subtree.
    #[serde(default)]
    pub include_descendants: bool,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub tenant_id: Uuid,
    pub entity_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub available_credits: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub reserved_credits: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "rust_decimal::serde::str_option")]
    pub subtree_available_credits: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descendant_count: Option<usize>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated_at: OffsetDateTime,
}

pub async fn get_balance(
    State(state): State<AppState>,
    Path((tenant_id, entity_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<BalanceQuery>,
) -> ApiResult<Json<BalanceResponse>> {
    // Reject unknown entities before lazily creating a balance row.
    let entity = state.ledger.directory.resolve(tenant_id, entity_id).await?;
    if entity.is_none() {
        return Err(LedgerError::EntityNotFound {
            tenant_id,
            entity_id,
        }
        .into());
    }

    let credit = state.ledger.credits.get_balance(tenant_id, entity_id).await?;

    let (subtree_available_credits, descendant_count) = if query.include_descendants {
        let (total, count) = state
            .ledger
            .credits
            .subtree_balance(tenant_id, entity_id)
            .await?;
        (Some(total), Some(count))
    } else {
        (None, None)
    };

    Ok(Json(BalanceResponse {
        tenant_id: credit.tenant_id,
        entity_id: credit.entity_id,
        available_credits: credit.available_credits,
        reserved_credits: credit.reserved_credits,
        subtree_available_credits,
        descendant_count,
        last_updated_at: credit.last_updated_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AllocationRequestItem {
    pub entity_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct BulkAllocateRequest {
    pub allocations: Vec<AllocationRequestItem>,
    /// Groups the per-entity idempotency keys of this batch.
    pub operation_code: String,
}

#[derive(Debug, Serialize)]
pub struct AllocationResultItem {
    pub entity_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "rust_decimal::serde::str_option")]
    pub new_balance: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BulkAllocateResponse {
    pub results: Vec<AllocationResultItem>,
    pub succeeded: usize,
    pub failed: usize,
}

pub async fn bulk_allocate(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(request): Json<BulkAllocateRequest>,
) -> ApiResult<Json<BulkAllocateResponse>> {
    if request.allocations.is_empty() {
        return Err(LedgerError::Validation("allocations must be non-empty".into()).into());
    }
    if request.operation_code.trim().is_empty() {
        return Err(LedgerError::Validation("operation_code is required".into()).into());
    }
    for item in &request.allocations {
        if item.amount <= Decimal::ZERO {
            return Err(LedgerError::Validation(format!(
                "allocation amount for entity {} must be positive",
                item.entity_id
            ))
            .into());
        }
    }

    let allocations: Vec<EntityAllocation> = request
        .allocations
        .iter()
        .map(|item| EntityAllocation {
            entity_id: item.entity_id,
            amount: item.amount,
        })
        .collect();

    let outcomes = state
        .ledger
        .credits
        .bulk_allocate(
            tenant_id,
            &allocations,
            TransactionType::Purchase,
            &request.operation_code,
        )
        .await;

    let results: Vec<AllocationResultItem> = outcomes
        .into_iter()
        .map(|outcome| match outcome.result {
            Ok(delta) => AllocationResultItem {
                entity_id: outcome.entity_id,
                success: true,
                new_balance: Some(delta.new_balance),
                error: None,
            },
            Err(e) => AllocationResultItem {
                entity_id: outcome.entity_id,
                success: false,
                new_balance: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    let succeeded = results.iter().filter(|r| r.success).count();
    let failed = results.len() - succeeded;

    Ok(Json(BulkAllocateResponse {
        results,
        succeeded,
        failed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct TransactionQuery {
    pub entity_id: Option<Uuid>,
    pub transaction_type: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_after: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_before: Option<OffsetDateTime>,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct TransactionResponseItem {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub transaction_type: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub previous_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub new_balance: Decimal,
    pub operation_code: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct TransactionListResponse {
    pub transactions: Vec<TransactionResponseItem>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<TransactionQuery>,
) -> ApiResult<Json<TransactionListResponse>> {
    let transaction_type = match query.transaction_type.as_deref() {
        Some(s) => Some(TransactionType::from_str(s).ok_or_else(|| {
            LedgerError::Validation(format!("unknown transaction_type '{}'", s))
        })?),
        None => None,
    };

    let filter = TransactionFilter {
        tenant_id: Some(tenant_id),
        entity_id: query.entity_id,
        transaction_type,
        created_after: query.created_after,
        created_before: query.created_before,
        min_amount: query.min_amount,
        max_amount: query.max_amount,
        limit: query.limit.unwrap_or(50),
        offset: query.offset.unwrap_or(0),
    };

    let page = state.ledger.credits.list_transactions(&filter).await?;

    Ok(Json(TransactionListResponse {
        transactions: page
            .transactions
            .into_iter()
            .map(|tx| TransactionResponseItem {
                id: tx.id,
                entity_id: tx.entity_id,
                transaction_type: tx.transaction_type,
                amount: tx.amount,
                previous_balance: tx.previous_balance,
                new_balance: tx.new_balance,
                operation_code: tx.operation_code,
                created_at: tx.created_at,
            })
            .collect(),
        total: page.total,
        limit: page.limit,
        offset: page.offset,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn balance_serializes_amounts_as_strings() {
        let response = BalanceResponse {
            tenant_id: Uuid::new_v4(),
            entity_id: Uuid::new_v4(),
            available_credits: dec!(1250.50),
            reserved_credits: dec!(0),
            subtree_available_credits: None,
            descendant_count: None,
            last_updated_at: OffsetDateTime::now_utc(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["available_credits"], "1250.50");
        assert_eq!(json["reserved_credits"], "0");
        // Rollup fields only appear when requested.
        assert!(json.get("subtree_available_credits").is_none());
    }

    #[test]
    fn balance_includes_subtree_rollup_when_present() {
        let response = BalanceResponse {
            tenant_id: Uuid::new_v4(),
            entity_id: Uuid::new_v4(),
            available_credits: dec!(100),
            reserved_credits: dec!(0),
            subtree_available_credits: Some(dec!(475.25)),
            descendant_count: Some(3),
            last_updated_at: OffsetDateTime::now_utc(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["subtree_available_credits"], "475.25");
        assert_eq!(json["descendant_count"], 3);
    }

    #[test]
    fn balance_query_defaults_to_entity_only() {
        let query: BalanceQuery = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!query.include_descendants);
    }

    #[test]
    fn bulk_request_parses_decimal_strings() {
        let body = serde_json::json!({
            "allocations": [
                { "entity_id": Uuid::new_v4(), "amount": "100.25" }
            ],
            "operation_code": "grant:q3"
        });
        let request: BulkAllocateRequest = serde_json::from_value(body).unwrap();
        assert_eq!(request.allocations[0].amount, dec!(100.25));
    }

    #[test]
    fn bulk_request_rejects_numeric_amounts() {
        // Amounts must be strings, never JSON floats.
        let body = serde_json::json!({
            "allocations": [
                { "entity_id": Uuid::new_v4(), "amount": 100.25 }
            ],
            "operation_code": "grant:q3"
        });
        assert!(serde_json::from_value::<BulkAllocateRequest>(body).is_err());
    }
}
